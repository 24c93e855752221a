//! Observer for batch download progress.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::request::Request;
use crate::control::panic_message;

/// Per-request download events. Every method defaults to doing nothing.
pub trait Listener: Send + Sync {
    /// An attempt at one of the request's candidates is starting.
    fn download_started(&self, _request: &Request) {}

    /// The request was downloaded.
    fn download_succeeded(&self, _request: &Request) {}

    /// Every candidate of the request failed.
    fn download_failed(&self, _request: &Request) {}
}

#[derive(Clone, Copy)]
pub(crate) enum ListenerEvent {
    Started,
    Succeeded,
    Failed,
}

/// Forwards an event, logging a panicking listener instead of propagating it.
pub(crate) fn notify(listener: Option<&dyn Listener>, event: ListenerEvent, request: &Request) {
    let Some(listener) = listener else {
        return;
    };
    let result = catch_unwind(AssertUnwindSafe(|| match event {
        ListenerEvent::Started => listener.download_started(request),
        ListenerEvent::Succeeded => listener.download_succeeded(request),
        ListenerEvent::Failed => listener.download_failed(request),
    }));
    if let Err(panic) = result {
        tracing::error!(url = %request.url, "download listener panicked: {}", panic_message(&*panic));
    }
}

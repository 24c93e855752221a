//! One request at a time, one candidate at a time, on the calling thread.

use std::iter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::{BatchSetup, Downloaders};
use crate::content::catalog::ContentCatalog;
use crate::content::downloader::{DownloadEvents, DownloadItem};
use crate::content::listener::{notify, Listener, ListenerEvent};
use crate::content::report::{DownloadDetails, DownloadReport};
use crate::content::request::Request;
use crate::content::source::{ContentSource, SourceMap};
use crate::control::{panic_message, CancelFlag};

pub struct SerialBatch<'a> {
    setup: BatchSetup<'a>,
}

impl<'a> SerialBatch<'a> {
    pub fn new(
        cancel: &'a CancelFlag,
        primary: Arc<ContentSource>,
        sources: &'a SourceMap,
        catalog: &'a dyn ContentCatalog,
    ) -> Self {
        Self {
            setup: BatchSetup {
                cancel,
                primary,
                sources,
                catalog,
                listener: None,
            },
        }
    }

    pub fn with_listener(mut self, listener: &'a dyn Listener) -> Self {
        self.setup.listener = Some(listener);
        self
    }

    /// Downloads each request from its first candidate that succeeds.
    pub fn download(&self, requests: &mut [Request]) -> DownloadReport {
        let setup = &self.setup;
        let mut report = setup.new_report();
        let mut downloaders = Downloaders::default();
        for request in requests.iter_mut() {
            if setup.cancel.is_set() {
                break;
            }
            request.find_sources(&setup.primary, setup.sources, setup.catalog);
            while let Some(candidate) = request.next_candidate() {
                if setup.cancel.is_set() {
                    break;
                }
                let source_id = candidate.source.id.clone();
                let downloader = match downloaders.get(&candidate.source) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!(source_id = %source_id, "no downloader: {:#}", e);
                        request.errors.push(format!("{:#}", e));
                        report.details(&source_id).total_failed += 1;
                        continue;
                    }
                };
                let item = DownloadItem {
                    url: candidate.url,
                    destination: request.destination.clone(),
                    tag: 0,
                };
                let mut events = SerialEvents {
                    listener: setup.listener,
                    request: &mut *request,
                    details: report.details(&source_id),
                    reported: false,
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    downloader.download(&mut iter::once(item.clone()), &mut events)
                }));
                if !events.reported {
                    let error = match outcome {
                        Err(panic) => format!("downloader panicked: {}", panic_message(&*panic)),
                        Ok(()) => "downloader did not report an outcome".to_string(),
                    };
                    tracing::error!(source_id = %source_id, url = %item.url, "{}", error);
                    events.download_failed(&item, &error);
                }
                if request.downloaded {
                    break;
                }
            }
            if !request.downloaded && !setup.cancel.is_set() {
                notify(setup.listener, ListenerEvent::Failed, request);
            }
        }
        report
    }
}

struct SerialEvents<'r> {
    listener: Option<&'r dyn Listener>,
    request: &'r mut Request,
    details: &'r mut DownloadDetails,
    reported: bool,
}

impl DownloadEvents for SerialEvents<'_> {
    fn download_started(&mut self, _item: &DownloadItem) {
        notify(self.listener, ListenerEvent::Started, self.request);
    }

    fn download_succeeded(&mut self, _item: &DownloadItem) {
        self.reported = true;
        self.details.total_succeeded += 1;
        self.request.downloaded = true;
        notify(self.listener, ListenerEvent::Succeeded, self.request);
    }

    fn download_failed(&mut self, item: &DownloadItem, error: &str) {
        self.reported = true;
        self.details.total_failed += 1;
        tracing::info!(url = %item.url, "download failed: {}", error);
        self.request.errors.push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::catalog::InMemoryCatalog;
    use crate::content::test_support::{
        catalog_for, unit, CountingListener, FailingDownloader, NullDownloader, PanickingDownloader,
        stub_cataloger,
    };
    use crate::content::PRIMARY_ID;

    #[test]
    fn falls_back_in_priority_order() {
        let (sources, catalog) = catalog_for(&[
            ("s1", 1, stub_cataloger(Arc::new(FailingDownloader))),
            ("s2", 2, stub_cataloger(Arc::new(NullDownloader))),
        ]);
        let primary = Arc::new(ContentSource::primary(Arc::new(NullDownloader)));
        let listener = CountingListener::default();
        let cancel = CancelFlag::new();
        let mut requests = vec![Request::new("rpm", unit("zsh"), "http://p/zsh", "/tmp/zsh")];

        let report = SerialBatch::new(&cancel, primary, &sources, &catalog)
            .with_listener(&listener)
            .download(&mut requests);

        assert!(requests[0].downloaded);
        assert_eq!(requests[0].errors.len(), 1);
        assert_eq!(report.downloads["s1"].total_failed, 1);
        assert_eq!(report.downloads["s2"].total_succeeded, 1);
        assert!(!report.downloads.contains_key(PRIMARY_ID));
        assert_eq!(listener.counts(), (2, 1, 0));
    }

    #[test]
    fn panicking_downloader_is_a_failure() {
        let (sources, catalog) =
            catalog_for(&[("s1", 1, stub_cataloger(Arc::new(PanickingDownloader)))]);
        let primary = Arc::new(ContentSource::primary(Arc::new(FailingDownloader)));
        let listener = CountingListener::default();
        let cancel = CancelFlag::new();
        let mut requests = vec![Request::new("rpm", unit("zsh"), "http://p/zsh", "/tmp/zsh")];

        let report = SerialBatch::new(&cancel, primary, &sources, &catalog)
            .with_listener(&listener)
            .download(&mut requests);

        assert!(!requests[0].downloaded);
        assert_eq!(requests[0].errors.len(), 2);
        assert!(requests[0].errors[0].contains("panicked"));
        assert_eq!(report.total_failed(), 2);
        assert_eq!(listener.counts(), (2, 0, 1));
    }

    #[test]
    fn canceled_batch_does_nothing() {
        let cancel = CancelFlag::new();
        cancel.set();
        let primary = Arc::new(ContentSource::primary(Arc::new(NullDownloader)));
        let sources = SourceMap::new();
        let catalog = InMemoryCatalog::new();
        let mut requests = vec![Request::new("rpm", unit("zsh"), "http://p/zsh", "/tmp/zsh")];
        let report = SerialBatch::new(&cancel, primary, &sources, &catalog).download(&mut requests);
        assert!(!requests[0].downloaded);
        assert!(report.downloads.is_empty());
        assert_eq!(report.total_passes, 1);
    }
}

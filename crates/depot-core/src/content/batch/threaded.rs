//! Concurrent batch: one worker thread per source, fed through a bounded queue.
//!
//! The calling thread is the orchestrator. It resolves candidates, places each
//! request on its current candidate source's queue, and consumes worker outcomes
//! from a channel. A failed attempt is re-dispatched to the request's next
//! candidate by the orchestrator, never by a worker, so workers only ever block
//! on their own queue.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::Duration;

use super::{BatchSetup, Downloaders};
use crate::content::catalog::ContentCatalog;
use crate::content::downloader::{DownloadEvents, DownloadItem, Downloader};
use crate::content::listener::{notify, Listener, ListenerEvent};
use crate::content::report::DownloadReport;
use crate::content::request::Request;
use crate::content::source::{ContentSource, SourceMap};
use crate::control::{lock, panic_message, CancelFlag};

const DEFAULT_POLL: Duration = Duration::from_millis(500);

pub struct ThreadedBatch<'a> {
    setup: BatchSetup<'a>,
    poll: Duration,
}

impl<'a> ThreadedBatch<'a> {
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
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_listener(mut self, listener: &'a dyn Listener) -> Self {
        self.setup.listener = Some(listener);
        self
    }

    /// How often blocked queue operations and the orchestrator re-check the
    /// cancel flag.
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    /// Downloads all requests, each from its first candidate that succeeds.
    /// Returns once every dispatched request is settled, or soon after cancel.
    pub fn download(&self, requests: &mut [Request]) -> DownloadReport {
        let mut report = self.setup.new_report();
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            let mut run = Run {
                batch: self,
                workers: Workers {
                    scope,
                    cancel: self.setup.cancel.clone(),
                    poll: self.poll,
                    tx,
                    downloaders: Downloaders::default(),
                    queues: BTreeMap::new(),
                    closing: false,
                },
                rx,
                in_flight: 0,
            };
            run.submit_all(requests, &mut report);
            run.wait(requests, &mut report);
            run.shutdown(requests, &mut report);
        });
        report
    }
}

enum Outcome {
    Started { tag: usize },
    Succeeded { tag: usize, source_id: String },
    Failed { tag: usize, source_id: String, error: String },
}

struct Run<'b, 'scope, 'env> {
    batch: &'b ThreadedBatch<'b>,
    workers: Workers<'scope, 'env>,
    rx: Receiver<Outcome>,
    /// Requests placed on a queue and not yet settled.
    in_flight: usize,
}

impl Run<'_, '_, '_> {
    fn canceled(&self) -> bool {
        self.batch.setup.cancel.is_set()
    }

    fn submit_all(&mut self, requests: &mut [Request], report: &mut DownloadReport) {
        let batch = self.batch;
        let setup = &batch.setup;
        for tag in 0..requests.len() {
            if self.canceled() {
                break;
            }
            let request = &mut requests[tag];
            request.find_sources(&setup.primary, setup.sources, setup.catalog);
            if self.dispatch(tag, request, report) {
                self.in_flight += 1;
            } else if !self.canceled() {
                notify(setup.listener, ListenerEvent::Failed, request);
            }
            while let Ok(outcome) = self.rx.try_recv() {
                self.handle(outcome, requests, report);
            }
        }
    }

    fn wait(&mut self, requests: &mut [Request], report: &mut DownloadReport) {
        while self.in_flight > 0 && !self.canceled() {
            match self.rx.recv_timeout(self.batch.poll) {
                Ok(outcome) => self.handle(outcome, requests, report),
                Err(RecvTimeoutError::Timeout) => {
                    if self.workers.all_finished() {
                        tracing::error!(
                            in_flight = self.in_flight,
                            "download workers exited with requests outstanding"
                        );
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Stops and joins every worker, then tallies outcomes reported meanwhile.
    fn shutdown(&mut self, requests: &mut [Request], report: &mut DownloadReport) {
        self.workers.close_and_join();
        let late: Vec<Outcome> = self.rx.try_iter().collect();
        for outcome in late {
            self.handle(outcome, requests, report);
        }
    }

    /// Places the request on its next usable candidate's queue. False when no
    /// candidate is left or the batch was canceled first.
    fn dispatch(&mut self, tag: usize, request: &mut Request, report: &mut DownloadReport) -> bool {
        while let Some(candidate) = request.next_candidate() {
            let queue = match self.workers.queue_for(&candidate.source) {
                Ok(queue) => queue,
                Err(e) => {
                    tracing::error!(source_id = %candidate.source.id, "cannot use source: {:#}", e);
                    request.errors.push(format!("{:#}", e));
                    report.details(&candidate.source.id).total_failed += 1;
                    continue;
                }
            };
            return queue.put(DownloadItem {
                url: candidate.url,
                destination: request.destination.clone(),
                tag,
            });
        }
        false
    }

    fn handle(&mut self, outcome: Outcome, requests: &mut [Request], report: &mut DownloadReport) {
        let listener = self.batch.setup.listener;
        match outcome {
            Outcome::Started { tag } => {
                if !self.canceled() {
                    notify(listener, ListenerEvent::Started, &requests[tag]);
                }
            }
            Outcome::Succeeded { tag, source_id } => {
                report.details(&source_id).total_succeeded += 1;
                let request = &mut requests[tag];
                request.downloaded = true;
                self.in_flight = self.in_flight.saturating_sub(1);
                if !self.canceled() {
                    notify(listener, ListenerEvent::Succeeded, request);
                }
            }
            Outcome::Failed {
                tag,
                source_id,
                error,
            } => {
                report.details(&source_id).total_failed += 1;
                let request = &mut requests[tag];
                tracing::info!(source_id = %source_id, url = %request.url, "download failed: {}", error);
                request.errors.push(error);
                if !self.canceled() && self.dispatch(tag, request, report) {
                    return;
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                if !self.canceled() {
                    notify(listener, ListenerEvent::Failed, request);
                }
            }
        }
    }
}

struct Worker<'scope> {
    queue: Arc<RequestQueue>,
    handle: ScopedJoinHandle<'scope, ()>,
}

/// Per-source queues and their worker threads, created on first dispatch.
struct Workers<'scope, 'env> {
    scope: &'scope Scope<'scope, 'env>,
    cancel: CancelFlag,
    poll: Duration,
    tx: Sender<Outcome>,
    downloaders: Downloaders,
    queues: BTreeMap<String, Worker<'scope>>,
    closing: bool,
}

impl<'scope> Workers<'scope, '_> {
    fn queue_for(&mut self, source: &ContentSource) -> Result<Arc<RequestQueue>> {
        if let Some(worker) = self.queues.get(&source.id) {
            return Ok(Arc::clone(&worker.queue));
        }
        if self.closing {
            anyhow::bail!("batch is shutting down");
        }
        let downloader = self.downloaders.get(source)?;
        let queue = Arc::new(RequestQueue::new(
            source.max_concurrent,
            self.cancel.clone(),
            self.poll,
        ));
        let handle = {
            let queue = Arc::clone(&queue);
            let tx = self.tx.clone();
            let source_id = source.id.clone();
            thread::Builder::new()
                .name(format!("content-{}", source.id))
                .spawn_scoped(self.scope, move || run_worker(&source_id, downloader, &queue, tx))
                .context("spawn download worker")?
        };
        tracing::debug!(source_id = %source.id, capacity = queue.capacity, "started download worker");
        self.queues.insert(
            source.id.clone(),
            Worker {
                queue: Arc::clone(&queue),
                handle,
            },
        );
        Ok(queue)
    }

    fn all_finished(&self) -> bool {
        self.queues.values().all(|w| w.handle.is_finished())
    }

    fn close_and_join(&mut self) {
        self.closing = true;
        for worker in self.queues.values() {
            worker.queue.close();
        }
        for (source_id, worker) in std::mem::take(&mut self.queues) {
            if let Err(panic) = worker.handle.join() {
                tracing::error!(source_id = %source_id, "download worker died: {}", panic_message(&*panic));
            }
        }
    }
}

/// Feeds one source's downloader from its queue until the batch closes it.
fn run_worker(
    source_id: &str,
    downloader: Arc<dyn Downloader>,
    queue: &RequestQueue,
    tx: Sender<Outcome>,
) {
    let outstanding = Rc::new(RefCell::new(Vec::new()));
    let mut feed = Feed {
        queue,
        outstanding: Rc::clone(&outstanding),
    };
    let mut events = ChannelEvents {
        source_id: source_id.to_string(),
        tx,
        outstanding: Rc::clone(&outstanding),
    };
    let result = catch_unwind(AssertUnwindSafe(|| downloader.download(&mut feed, &mut events)));
    let error = match result {
        Ok(()) => "downloader did not report an outcome".to_string(),
        Err(panic) => {
            let message = format!("download worker panicked: {}", panic_message(&*panic));
            tracing::error!(source_id = %source_id, "{}", message);
            message
        }
    };
    let lost: Vec<DownloadItem> = outstanding.borrow_mut().drain(..).collect();
    for item in lost {
        events.download_failed(&item, &error);
    }
    // Anything still queued would otherwise never settle.
    while let Some(item) = feed.next() {
        events.download_failed(&item, &error);
    }
}

/// Blocking iterator over a worker's queue; remembers what it handed out.
struct Feed<'q> {
    queue: &'q RequestQueue,
    outstanding: Rc<RefCell<Vec<DownloadItem>>>,
}

impl Iterator for Feed<'_> {
    type Item = DownloadItem;

    fn next(&mut self) -> Option<DownloadItem> {
        let item = self.queue.get()?;
        self.outstanding.borrow_mut().push(item.clone());
        Some(item)
    }
}

struct ChannelEvents {
    source_id: String,
    tx: Sender<Outcome>,
    outstanding: Rc<RefCell<Vec<DownloadItem>>>,
}

impl ChannelEvents {
    fn settle(&self, item: &DownloadItem) {
        let mut outstanding = self.outstanding.borrow_mut();
        if let Some(at) = outstanding.iter().position(|i| i.tag == item.tag) {
            outstanding.remove(at);
        }
    }

    fn send(&self, outcome: Outcome) {
        // The orchestrator only stops listening once every worker is joined.
        let _ = self.tx.send(outcome);
    }
}

impl DownloadEvents for ChannelEvents {
    fn download_started(&mut self, item: &DownloadItem) {
        self.send(Outcome::Started { tag: item.tag });
    }

    fn download_succeeded(&mut self, item: &DownloadItem) {
        self.settle(item);
        self.send(Outcome::Succeeded {
            tag: item.tag,
            source_id: self.source_id.clone(),
        });
    }

    fn download_failed(&mut self, item: &DownloadItem, error: &str) {
        self.settle(item);
        self.send(Outcome::Failed {
            tag: item.tag,
            source_id: self.source_id.clone(),
            error: error.to_string(),
        });
    }
}

struct QueueState {
    /// `None` marks the end of work.
    items: VecDeque<Option<DownloadItem>>,
    halted: bool,
}

/// Bounded hand-off between the orchestrator and one worker.
struct RequestQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    cancel: CancelFlag,
    poll: Duration,
}

impl RequestQueue {
    fn new(capacity: usize, cancel: CancelFlag, poll: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                halted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            cancel,
            poll,
        }
    }

    fn running(&self, state: &QueueState) -> bool {
        !state.halted && !self.cancel.is_set()
    }

    /// Blocks while full. False if canceled or halted before the item was placed.
    fn put(&self, item: DownloadItem) -> bool {
        let mut state = lock(&self.state);
        loop {
            if !self.running(&state) {
                return false;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(Some(item));
                self.not_empty.notify_one();
                return true;
            }
            state = self
                .not_full
                .wait_timeout(state, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Blocks while empty. `None` at the end marker or once canceled or halted.
    fn get(&self) -> Option<DownloadItem> {
        let mut state = lock(&self.state);
        loop {
            if !self.running(&state) {
                return None;
            }
            if let Some(slot) = state.items.pop_front() {
                self.not_full.notify_one();
                return slot;
            }
            state = self
                .not_empty
                .wait_timeout(state, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Appends the end marker and halts the queue.
    ///
    /// Requests still queued are abandoned: `get` returns `None` from here on,
    /// so this is not a graceful drain.
    fn close(&self) {
        let mut state = lock(&self.state);
        state.items.push_back(None);
        state.halted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::test_support::{
        catalog_for, stub_cataloger, unit, CountingListener, FailingDownloader, NullDownloader,
        PanickingDownloader,
    };
    use std::path::PathBuf;
    use std::time::Instant;

    fn item(tag: usize) -> DownloadItem {
        DownloadItem {
            url: format!("http://h/{}", tag),
            destination: PathBuf::from(format!("/tmp/{}", tag)),
            tag,
        }
    }

    #[test]
    fn queue_is_bounded_and_fifo() {
        let queue = RequestQueue::new(2, CancelFlag::new(), Duration::from_millis(5));
        assert!(queue.put(item(0)));
        assert!(queue.put(item(1)));
        assert_eq!(queue.get().map(|i| i.tag), Some(0));
        assert!(queue.put(item(2)));
        assert_eq!(queue.get().map(|i| i.tag), Some(1));
        assert_eq!(queue.get().map(|i| i.tag), Some(2));
        queue.close();
        assert!(queue.get().is_none());
        assert!(!queue.put(item(3)));
    }

    #[test]
    fn close_abandons_queued_items() {
        let queue = RequestQueue::new(4, CancelFlag::new(), Duration::from_millis(5));
        assert!(queue.put(item(0)));
        assert!(queue.put(item(1)));
        queue.close();
        assert!(queue.get().is_none());
        assert_eq!(lock(&queue.state).items.len(), 3);
    }

    #[test]
    fn full_queue_put_gives_up_on_cancel() {
        let cancel = CancelFlag::new();
        let queue = RequestQueue::new(1, cancel.clone(), Duration::from_millis(5));
        assert!(queue.put(item(0)));
        let started = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                cancel.set();
            });
            assert!(!queue.put(item(1)));
        });
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert!(queue.get().is_none());
    }

    fn requests(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| Request::new("rpm", unit("zsh"), format!("http://p/{}", i), format!("/tmp/{}", i)))
            .collect()
    }

    #[test]
    fn falls_back_to_next_source() {
        let (sources, catalog) = catalog_for(&[
            ("s1", 1, stub_cataloger(Arc::new(FailingDownloader))),
            ("s2", 2, stub_cataloger(Arc::new(NullDownloader))),
        ]);
        let primary = Arc::new(ContentSource::primary(Arc::new(FailingDownloader)));
        let listener = CountingListener::default();
        let cancel = CancelFlag::new();
        let mut requests = requests(5);

        let report = ThreadedBatch::new(&cancel, primary, &sources, &catalog)
            .with_listener(&listener)
            .with_poll(Duration::from_millis(10))
            .download(&mut requests);

        assert!(requests.iter().all(|r| r.downloaded && r.errors.len() == 1));
        assert_eq!(report.downloads["s1"].total_failed, 5);
        assert_eq!(report.downloads["s2"].total_succeeded, 5);
        assert_eq!(report.total_sources, 2);
        assert_eq!(listener.counts(), (10, 5, 0));
    }

    #[test]
    fn worker_panic_fails_over_without_hanging() {
        let (sources, catalog) =
            catalog_for(&[("s1", 1, stub_cataloger(Arc::new(PanickingDownloader)))]);
        let primary = Arc::new(ContentSource::primary(Arc::new(NullDownloader)));
        let cancel = CancelFlag::new();
        let mut requests = requests(3);

        let report = ThreadedBatch::new(&cancel, primary, &sources, &catalog)
            .with_poll(Duration::from_millis(10))
            .download(&mut requests);

        assert!(requests.iter().all(|r| r.downloaded));
        assert!(requests
            .iter()
            .all(|r| r.errors.len() == 1 && r.errors[0].contains("panicked")));
        assert_eq!(report.downloads["s1"].total_failed, 3);
        assert_eq!(report.downloads[crate::content::PRIMARY_ID].total_succeeded, 3);
    }

    #[test]
    fn exhausted_candidates_report_failure() {
        let (sources, catalog) = catalog_for(&[("s1", 1, stub_cataloger(Arc::new(FailingDownloader)))]);
        let primary = Arc::new(ContentSource::primary(Arc::new(FailingDownloader)));
        let listener = CountingListener::default();
        let cancel = CancelFlag::new();
        let mut requests = requests(2);

        let report = ThreadedBatch::new(&cancel, primary, &sources, &catalog)
            .with_listener(&listener)
            .with_poll(Duration::from_millis(10))
            .download(&mut requests);

        assert!(requests.iter().all(|r| !r.downloaded && r.errors.len() == 2));
        assert_eq!(report.total_failed(), 4);
        assert_eq!(listener.counts().2, 2);
    }
}

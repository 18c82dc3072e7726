// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live feeds: listener, control handle and the delivery task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

use super::{ChangeRow, ChangesFeed, ChangesOptions, Since};
use crate::error::{DocError, Result};
use crate::metrics;

/// Lifecycle of a live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Active,
    /// Terminal. Also reached when a feed finishes on its own.
    Cancelled,
    /// Terminal. A backend failure stopped delivery.
    Errored,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Errored => write!(f, "Errored"),
        }
    }
}

/// Why a live feed stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// `cancel()` was called, or the database closed.
    Cancelled,
    /// `limit` rows were delivered.
    Complete,
    /// No new entries within `timeout`.
    Timeout,
}

impl CompletionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Complete => "complete",
            Self::Timeout => "timeout",
        }
    }
}

/// Passed to `on_complete` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    pub status: CompletionStatus,
    /// Highest seq the feed consumed.
    pub last_seq: u64,
    /// Rows handed to `on_change`.
    pub delivered: usize,
}

/// Receives rows from a live feed.
///
/// Callbacks run on the feed's task. `on_change` may call
/// [`FeedControl::cancel`]; no further rows are delivered afterwards.
pub trait ChangesListener: Send + 'static {
    fn on_change(&mut self, row: &ChangeRow, control: &FeedControl);

    fn on_complete(&mut self, _summary: &ChangesSummary) {}

    fn on_error(&mut self, _error: &DocError) {}
}

type ChangeFn = Box<dyn FnMut(&ChangeRow, &FeedControl) + Send>;
type CompleteFn = Box<dyn FnMut(&ChangesSummary) + Send>;
type ErrorFn = Box<dyn FnMut(&DocError) + Send>;

/// Closure-based [`ChangesListener`].
///
/// ```rust
/// use doc_engine::changes::ChangesCallbacks;
///
/// let listener = ChangesCallbacks::new()
///     .on_change(|row, control| {
///         if row.deleted {
///             control.cancel();
///         }
///     })
///     .on_complete(|summary| println!("feed ended: {}", summary.status.as_str()));
/// # drop(listener);
/// ```
#[derive(Default)]
pub struct ChangesCallbacks {
    change: Option<ChangeFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
}

impl ChangesCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: FnMut(&ChangeRow, &FeedControl) + Send + 'static,
    {
        self.change = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut(&ChangesSummary) + Send + 'static,
    {
        self.complete = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(&DocError) + Send + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }
}

impl ChangesListener for ChangesCallbacks {
    fn on_change(&mut self, row: &ChangeRow, control: &FeedControl) {
        if let Some(f) = self.change.as_mut() {
            f(row, control);
        }
    }

    fn on_complete(&mut self, summary: &ChangesSummary) {
        if let Some(f) = self.complete.as_mut() {
            f(summary);
        }
    }

    fn on_error(&mut self, error: &DocError) {
        if let Some(f) = self.error.as_mut() {
            f(error);
        }
    }
}

struct ControlInner {
    state: watch::Sender<FeedState>,
    outcome: watch::Sender<Option<Result<ChangesSummary>>>,
}

/// Shared cancellation and status for one live feed.
#[derive(Clone)]
pub struct FeedControl {
    inner: Arc<ControlInner>,
}

impl fmt::Debug for FeedControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedControl").field("state", &self.state()).finish()
    }
}

impl FeedControl {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(FeedState::Active);
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControlInner { state, outcome }),
        }
    }

    /// Stop delivery. Returns `false` if the feed had already stopped.
    ///
    /// Never blocks, so it is safe to call from inside `on_change`.
    pub fn cancel(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == FeedState::Active {
                *state = FeedState::Cancelled;
                true
            } else {
                false
            }
        })
    }

    #[must_use]
    pub fn state(&self) -> FeedState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == FeedState::Active
    }

    /// Whether the task has run its completion callback.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.inner.state.subscribe()
    }

    fn mark_errored(&self) {
        self.inner.state.send_replace(FeedState::Errored);
    }

    /// Publish the final outcome. Runs after the listener's last callback.
    fn settle(&self, outcome: Result<ChangesSummary>) {
        self.inner.outcome.send_replace(Some(outcome));
    }

    async fn finished(&self) -> Result<ChangesSummary> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(DocError::DatabaseClosed))
    }
}

/// Handle returned by [`ChangesFeed::live`].
#[derive(Debug, Clone)]
pub struct ChangesHandle {
    control: FeedControl,
}

impl ChangesHandle {
    /// Stop delivery. Idempotent; see [`FeedControl::cancel`].
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    #[must_use]
    pub fn state(&self) -> FeedState {
        self.control.state()
    }

    #[must_use]
    pub fn control(&self) -> FeedControl {
        self.control.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Wait for the feed to stop. Errors if it stopped on a backend failure.
    pub async fn finished(&self) -> Result<ChangesSummary> {
        self.control.finished().await
    }
}

/// Pull-style live feed: rows arrive on a channel instead of a callback.
///
/// Dropping the stream cancels the feed.
pub struct ChangesStream {
    rows: mpsc::UnboundedReceiver<ChangeRow>,
    handle: ChangesHandle,
}

impl ChangesStream {
    /// Next row, or `None` once the feed has stopped and drained.
    pub async fn next(&mut self) -> Option<ChangeRow> {
        self.rows.recv().await
    }

    #[must_use]
    pub fn handle(&self) -> &ChangesHandle {
        &self.handle
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

impl Drop for ChangesStream {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<ChangeRow>,
}

impl ChangesListener for ChannelListener {
    fn on_change(&mut self, row: &ChangeRow, control: &FeedControl) {
        if self.tx.send(row.clone()).is_err() {
            control.cancel();
        }
    }
}

/// Counters carried through one run.
#[derive(Default)]
struct Progress {
    cursor: u64,
    delivered: usize,
}

impl ChangesFeed {
    /// Spawn a live feed on the current runtime.
    pub fn live<L: ChangesListener>(&self, mut opts: ChangesOptions, listener: L) -> Result<ChangesHandle> {
        self.check_view(&opts)?;
        // `Now` means the head at subscription, not when the task first runs.
        opts.since = Since::Seq(opts.since.resolve(self.log.head()));
        let control = FeedControl::new();
        let feed = self.clone();
        let task_control = control.clone();
        let span = tracing::info_span!("live_changes", since = ?opts.since);
        tokio::spawn(async move { feed.run_live(opts, listener, task_control).await }.instrument(span));
        Ok(ChangesHandle { control })
    }

    /// Spawn a live feed whose rows are read with [`ChangesStream::next`].
    pub fn live_stream(&self, opts: ChangesOptions) -> Result<ChangesStream> {
        let (tx, rows) = mpsc::unbounded_channel();
        let handle = self.live(opts, ChannelListener { tx })?;
        Ok(ChangesStream { rows, handle })
    }

    async fn run_live<L: ChangesListener>(self, opts: ChangesOptions, mut listener: L, control: FeedControl) {
        let mut progress = Progress::default();
        let result = self.deliver(&opts, &mut listener, &control, &mut progress).await;
        match result {
            Ok(mut status) => {
                // A cancel that raced with a natural finish wins.
                if control.state() == FeedState::Cancelled {
                    status = CompletionStatus::Cancelled;
                }
                let summary = ChangesSummary {
                    status,
                    last_seq: progress.cursor,
                    delivered: progress.delivered,
                };
                control.cancel();
                listener.on_complete(&summary);
                metrics::record_feed_finished(status.as_str());
                info!(
                    status = status.as_str(),
                    last_seq = summary.last_seq,
                    delivered = summary.delivered,
                    "Live changes feed finished"
                );
                control.settle(Ok(summary));
            }
            Err(e) => {
                warn!(error = %e, "Live changes feed failed");
                control.mark_errored();
                listener.on_error(&e);
                metrics::record_feed_finished("errored");
                control.settle(Err(e));
            }
        }
    }

    async fn deliver<L: ChangesListener>(
        &self,
        opts: &ChangesOptions,
        listener: &mut L,
        control: &FeedControl,
        progress: &mut Progress,
    ) -> Result<CompletionStatus> {
        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut head_rx = self.log.subscribe();
        let mut state_rx = control.watch_state();
        head_rx.borrow_and_update();
        let head = self.log.head();
        progress.cursor = opts.since.resolve(head);

        if limit == 0 {
            return Ok(CompletionStatus::Complete);
        }

        // Catch-up: collapsed snapshot, as a one-shot feed would return it.
        for entry in self.snapshot(progress.cursor, head) {
            if !control.is_active() {
                return Ok(CompletionStatus::Cancelled);
            }
            if let Some(row) = self.build_row(&entry, opts).await? {
                listener.on_change(&row, control);
                progress.delivered += 1;
                metrics::record_changes_delivered("live", 1);
                if progress.delivered >= limit {
                    progress.cursor = entry.seq;
                    return Ok(CompletionStatus::Complete);
                }
            }
        }
        progress.cursor = progress.cursor.max(head);
        debug!(cursor = progress.cursor, delivered = progress.delivered, "Catch-up delivered");

        loop {
            if !control.is_active() {
                return Ok(CompletionStatus::Cancelled);
            }
            head_rx.borrow_and_update();
            let page = self.log.page_after(progress.cursor, u64::MAX, self.log.page_size());

            if page.is_empty() {
                let woke = wait_for_entries(&mut head_rx, &mut state_rx, self.poll);
                match opts.timeout {
                    Some(timeout) => {
                        if tokio::time::timeout(timeout, woke).await.is_err() {
                            return Ok(CompletionStatus::Timeout);
                        }
                    }
                    None => woke.await,
                }
                continue;
            }

            for entry in page {
                if !control.is_active() {
                    return Ok(CompletionStatus::Cancelled);
                }
                progress.cursor = entry.seq;
                if let Some(row) = self.build_row(&entry, opts).await? {
                    listener.on_change(&row, control);
                    progress.delivered += 1;
                    metrics::record_changes_delivered("live", 1);
                    if progress.delivered >= limit {
                        return Ok(CompletionStatus::Complete);
                    }
                }
            }
        }
    }
}

/// Resolve when the head advances, the feed's state changes, or the poll
/// interval elapses.
async fn wait_for_entries(
    head_rx: &mut watch::Receiver<u64>,
    state_rx: &mut watch::Receiver<FeedState>,
    poll: Option<Duration>,
) {
    let poll_tick = async {
        match poll {
            Some(interval) => tokio::time::sleep(interval).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        changed = head_rx.changed() => {
            if changed.is_err() {
                // Log dropped: nothing more will arrive.
                std::future::pending::<()>().await;
            }
        }
        _ = state_rx.changed() => {}
        () = poll_tick => {}
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, put};
    use super::*;
    use serde_json::json;

    type Seen = Arc<parking_lot::Mutex<Vec<ChangeRow>>>;

    fn recorder() -> (ChangesCallbacks, Seen, Arc<parking_lot::Mutex<Vec<ChangesSummary>>>) {
        let seen: Seen = Arc::default();
        let done = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (s, d) = (Arc::clone(&seen), Arc::clone(&done));
        let listener = ChangesCallbacks::new()
            .on_change(move |row, _| s.lock().push(row.clone()))
            .on_complete(move |summary| d.lock().push(summary.clone()));
        (listener, seen, done)
    }

    #[tokio::test]
    async fn test_live_delivers_catch_up_then_new_entries() {
        let f = fixture();
        put(&f.store, json!({"_id": "a"})).await;
        let (listener, seen, done) = recorder();
        let handle = f.feed.live(ChangesOptions::new().limit(3), listener).unwrap();

        put(&f.store, json!({"_id": "b"})).await;
        put(&f.store, json!({"_id": "c"})).await;

        let summary = tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, CompletionStatus::Complete);
        assert_eq!(summary.delivered, 3);
        let ids: Vec<String> = seen.lock().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(done.lock().len(), 1);
        assert_eq!(handle.state(), FeedState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_completes_once() {
        let f = fixture();
        let (listener, _seen, done) = recorder();
        let handle = f.feed.live(ChangesOptions::new(), listener).unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let summary = handle.finished().await.unwrap();
        assert_eq!(summary.status, CompletionStatus::Cancelled);
        assert!(!handle.cancel());
        assert_eq!(done.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_from_inside_on_change() {
        let f = fixture();
        let rev = put(&f.store, json!({"_id": "watched"})).await;
        let seen: Seen = Arc::default();
        let s = Arc::clone(&seen);
        let listener = ChangesCallbacks::new().on_change(move |row, control| {
            s.lock().push(row.clone());
            if row.deleted {
                assert!(control.cancel());
            }
        });
        let handle = f
            .feed
            .live(ChangesOptions::new().since(Since::Now).doc_ids(["watched"]), listener)
            .unwrap();

        f.store.remove("watched", &rev).await.unwrap();
        put(&f.store, json!({"_id": "watched"})).await;

        let summary = handle.finished().await.unwrap();
        assert_eq!(summary.status, CompletionStatus::Cancelled);
        assert_eq!(summary.delivered, 1);
        assert!(seen.lock()[0].deleted);
    }

    #[tokio::test]
    async fn test_timeout_when_idle() {
        let f = fixture();
        let (listener, _seen, _done) = recorder();
        let handle = f
            .feed
            .live(ChangesOptions::new().timeout(Duration::from_millis(20)), listener)
            .unwrap();
        let summary = handle.finished().await.unwrap();
        assert_eq!(summary.status, CompletionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_stream_yields_rows_until_limit() {
        let f = fixture();
        let mut stream = f.feed.live_stream(ChangesOptions::new().limit(2)).unwrap();
        put(&f.store, json!({"_id": "x"})).await;
        put(&f.store, json!({"_id": "y"})).await;
        put(&f.store, json!({"_id": "z"})).await;

        assert_eq!(stream.next().await.unwrap().id, "x");
        assert_eq!(stream.next().await.unwrap().id, "y");
        assert!(stream.next().await.is_none());
        let summary = stream.handle().finished().await.unwrap();
        assert_eq!(summary.status, CompletionStatus::Complete);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(CompletionStatus::Cancelled).unwrap(), json!("cancelled"));
        assert_eq!(CompletionStatus::Timeout.as_str(), "timeout");
        assert_eq!(FeedState::Errored.to_string(), "Errored");
    }
}

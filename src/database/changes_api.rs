//! Changes API: one-shot snapshots and live feeds.

use tracing::debug;

use crate::changes::{
    ChangesHandle, ChangesListener, ChangesOptions, ChangesResponse, ChangesStream, FeedControl,
};
use crate::error::Result;
use crate::metrics;

use super::Database;

impl Database {
    /// Every document changed after `opts.since`, once each, at its latest seq.
    pub async fn changes(&self, opts: &ChangesOptions) -> Result<ChangesResponse> {
        self.ensure_ready()?;
        let _timer = metrics::LatencyTimer::new("changes");
        let result = self.feed.changes(opts).await;
        metrics::record_result("changes", &result);
        result
    }

    /// Start a live feed delivering to `listener`.
    ///
    /// The feed is cancelled when the database closes or is destroyed.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use doc_engine::{Database, DocEngineConfig};
    /// # use doc_engine::changes::{ChangesCallbacks, ChangesOptions, Since};
    /// # use serde_json::json;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let db = Database::in_memory(DocEngineConfig::default()).await.unwrap();
    /// let handle = db
    ///     .live_changes(
    ///         ChangesOptions::new().since(Since::Now).limit(1),
    ///         ChangesCallbacks::new().on_change(|row, _| println!("{} -> {}", row.id, row.seq)),
    ///     )
    ///     .unwrap();
    /// db.put(json!({"_id": "a"})).await.unwrap();
    /// let summary = handle.finished().await.unwrap();
    /// assert_eq!(summary.delivered, 1);
    /// # }
    /// ```
    pub fn live_changes<L: ChangesListener>(&self, opts: ChangesOptions, listener: L) -> Result<ChangesHandle> {
        self.ensure_ready()?;
        let handle = self.feed.live(opts, listener)?;
        self.track_feed(handle.control());
        Ok(handle)
    }

    /// Start a live feed read with [`ChangesStream::next`].
    pub fn changes_stream(&self, opts: ChangesOptions) -> Result<ChangesStream> {
        self.ensure_ready()?;
        let stream = self.feed.live_stream(opts)?;
        self.track_feed(stream.handle().control());
        Ok(stream)
    }

    /// Live feeds that have not finished yet.
    #[must_use]
    pub fn live_feed_count(&self) -> usize {
        let mut feeds = self.live_feeds.lock();
        feeds.retain(|f| !f.is_finished());
        feeds.len()
    }

    fn track_feed(&self, control: FeedControl) {
        let mut feeds = self.live_feeds.lock();
        feeds.retain(|f| !f.is_finished());
        feeds.push(control);
        metrics::set_live_feeds(feeds.len());
    }

    /// Cancel every tracked feed. Returns how many were still active.
    pub(super) fn cancel_feeds(&self) -> usize {
        let feeds: Vec<FeedControl> = std::mem::take(&mut *self.live_feeds.lock());
        let cancelled = feeds.iter().filter(|f| f.cancel()).count();
        metrics::set_live_feeds(0);
        debug!(cancelled, "Live feeds cancelled");
        cancelled
    }
}

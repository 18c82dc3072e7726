//! View API: design-document views, temporary views, cleanup.

use crate::error::Result;
use crate::metrics;
use crate::views::{QueryOptions, QueryResponse, ViewDefinition};

use super::Database;

impl Database {
    /// Attach `def` to the design document `ddoc_id` as `view_name`.
    ///
    /// Returns the `ddoc/view` name used by [`query_view`](Self::query_view).
    /// The index is dropped when the design document is updated or removed.
    pub async fn register_view(&self, ddoc_id: &str, view_name: &str, def: ViewDefinition) -> Result<String> {
        self.ensure_ready()?;
        self.views.register_design_view(ddoc_id, view_name, def).await
    }

    /// Query a registered view by `ddoc/view` name.
    pub async fn query_view(&self, name: &str, opts: &QueryOptions) -> Result<QueryResponse> {
        self.ensure_ready()?;
        let result = self.views.query_named(name, opts).await;
        metrics::record_result("query", &result);
        result
    }

    /// Query a temporary view. The index persists under the definition's
    /// name and is refreshed incrementally on later calls.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use doc_engine::{Database, DocEngineConfig};
    /// # use doc_engine::views::{QueryOptions, Reducer, ViewDefinition};
    /// # use serde_json::json;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let db = Database::in_memory(DocEngineConfig::default()).await.unwrap();
    /// db.put(json!({"_id": "a", "qty": 2})).await.unwrap();
    /// db.put(json!({"_id": "b", "qty": 5})).await.unwrap();
    ///
    /// let total = ViewDefinition::new("qty", |doc, emit| {
    ///     if let Some(qty) = doc.get("qty") {
    ///         emit.emit(doc["_id"].clone(), qty.clone());
    ///     }
    /// })
    /// .with_reduce(Reducer::Sum);
    ///
    /// let res = db.query(&total, &QueryOptions::new()).await.unwrap();
    /// assert_eq!(res.rows[0].value, json!(7));
    /// # }
    /// ```
    pub async fn query(&self, def: &ViewDefinition, opts: &QueryOptions) -> Result<QueryResponse> {
        self.ensure_ready()?;
        let result = self.views.query(def, opts).await;
        metrics::record_result("query", &result);
        result
    }

    /// Drop indexes whose design document is gone, and all temporary views.
    pub fn view_cleanup(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.views.cleanup())
    }

    /// Names of every live index.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        self.views.view_names()
    }
}

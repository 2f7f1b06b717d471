//! Document store seam.
//!
//! The interpreter only ever talks to a [`DocumentStore`]; both methods are
//! reads. The in-memory implementation backs the binaries and the tests.

pub mod eval;
pub mod memory;

use crate::error::Result;
use crate::query::ast::{FindQuery, Stage};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use memory::InMemoryStore;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Filtered read with population, ordering and projection.
    async fn find(&self, query: &FindQuery) -> Result<Vec<Value>>;

    /// Run a read-only stage sequence over one collection.
    async fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Value>>;
}

/// Rows returned by one interpreted query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub rows: Vec<Value>,
    pub row_count: usize,
}

impl ExecutionResult {
    pub fn new(rows: Vec<Value>) -> Self {
        let row_count = rows.len();
        Self { rows, row_count }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

//! Query representations accepted from the model.
//!
//! Three textual shapes are understood: a pipeline literal, a Mongo shell
//! call and a single SELECT statement. All three compile into the closed
//! AST in [`ast`].

pub mod ast;
pub mod call;
pub mod literal;
pub mod pipeline;
pub mod select;

use ast::{FindQuery, Stage};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryShape {
    AggregationPipeline,
    MongoQuery,
    DeclarativeSelect,
}

impl QueryShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryShape::AggregationPipeline => "AggregationPipeline",
            QueryShape::MongoQuery => "MongoQuery",
            QueryShape::DeclarativeSelect => "DeclarativeSelect",
        }
    }
}

const CALL_HINTS: &[&str] = &["aggregate(", "find(", "findone(", "countdocuments(", "db."];

/// Classify candidate text. Literals win, then call hints; everything else
/// is treated as a SELECT and left for the SELECT compiler to reject.
pub fn detect_shape(text: &str) -> QueryShape {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return QueryShape::AggregationPipeline;
    }
    let lower = trimmed.to_lowercase();
    if CALL_HINTS.iter().any(|hint| lower.contains(hint)) {
        QueryShape::MongoQuery
    } else {
        QueryShape::DeclarativeSelect
    }
}

/// Executable form of a validated candidate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryPlan {
    #[serde(rename_all = "camelCase")]
    Aggregation { collection: String, stages: Vec<Stage> },
    /// `find()` read; `count` turns the rows into a single count document.
    #[serde(rename_all = "camelCase")]
    Filter { query: FindQuery, count: Option<String> },
    #[serde(rename_all = "camelCase")]
    Select { query: FindQuery, count: Option<String> },
}

impl QueryPlan {
    pub fn collection(&self) -> &str {
        match self {
            QueryPlan::Aggregation { collection, .. } => collection,
            QueryPlan::Filter { query, .. } | QueryPlan::Select { query, .. } => &query.collection,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredQuery {
    pub raw: String,
    pub shape: QueryShape,
    pub plan: QueryPlan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_shape() {
        assert_eq!(detect_shape("  [{ $match: {} }]"), QueryShape::AggregationPipeline);
        assert_eq!(
            detect_shape("{ collection: 'products', pipeline: [] }"),
            QueryShape::AggregationPipeline
        );
        assert_eq!(detect_shape("db.products.find({})"), QueryShape::MongoQuery);
        assert_eq!(detect_shape("FIND({ price: 1 })"), QueryShape::MongoQuery);
        assert_eq!(detect_shape("SELECT * FROM products"), QueryShape::DeclarativeSelect);
    }
}

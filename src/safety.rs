//! Query Safety Validator
//!
//! Screens model-generated query text before anything runs. Two phases,
//! both must pass:
//!
//! 1. Lexical: no deny-listed word anywhere in the text.
//! 2. Structural: the text is exactly one of the accepted read shapes, and
//!    no pipeline names a write or replace stage.
//!
//! A passing candidate is wrapped in [`ValidatedQuery`], the only input the
//! interpreter accepts.

use crate::catalog::SchemaCatalog;
use crate::error::{AssistantError, Result};
use crate::query::call::{parse_mongo_call, MongoCall};
use crate::query::literal::{parse_literal, Literal};
use crate::query::{detect_shape, QueryShape};
use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

/// Write keywords rejected anywhere in a candidate query.
pub const DENIED_WORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "truncate", "alter", "create", "grant", "revoke", "exec",
    "execute",
];

/// Server-side code execution operators; never part of a read here.
const CODE_OPERATORS: &[&str] = &["$where", "$function", "$accumulator"];

const FIND_METHODS: &[&str] = &["find", "findOne", "countDocuments"];
const CURSOR_MODIFIERS: &[&str] = &["sort", "limit", "skip", "count"];

lazy_static::lazy_static! {
    static ref WRITE_STAGE_TEXT: Regex =
        Regex::new(r#"(?i)\$\s*(out|merge|replaceroot|replacewith)\b"#).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ValidationVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Candidate text that passed both phases.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    text: String,
    shape: QueryShape,
}

impl ValidatedQuery {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn shape(&self) -> QueryShape {
        self.shape
    }
}

pub struct QuerySafetyValidator<'a> {
    catalog: &'a SchemaCatalog,
}

impl<'a> QuerySafetyValidator<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    /// Pure verdict, no side effects beyond logging.
    pub fn verdict(&self, text: &str) -> ValidationVerdict {
        if let Some(word) = first_denied_word(text) {
            return ValidationVerdict::deny(format!("deny-listed word `{}`", word));
        }
        match self.check_structure(text) {
            Ok(()) => ValidationVerdict::allow(),
            Err(reason) => ValidationVerdict::deny(reason),
        }
    }

    pub fn validate(&self, text: &str) -> Result<ValidatedQuery> {
        let verdict = self.verdict(text);
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or_default();
            warn!("Rejected generated query: {}", reason);
            return Err(AssistantError::UnauthorizedOperation(reason));
        }
        let shape = detect_shape(text);
        debug!("Query passed validation as {}", shape.as_str());
        Ok(ValidatedQuery {
            text: text.trim().to_string(),
            shape,
        })
    }

    fn check_structure(&self, text: &str) -> std::result::Result<(), String> {
        if text.trim().is_empty() {
            return Err("empty query".to_string());
        }
        match detect_shape(text) {
            QueryShape::AggregationPipeline => {
                self.check_write_text(text)?;
                let literal = parse_literal(text).map_err(|e| e.to_string())?;
                let stages = pipeline_stages(&literal)?;
                self.check_stages(stages)?;
                self.check_walk(&literal)
            }
            QueryShape::MongoQuery => {
                self.check_write_text(text)?;
                let call = parse_mongo_call(text).map_err(|e| e.to_string())?;
                self.check_call(&call)
            }
            QueryShape::DeclarativeSelect => check_select(text),
        }
    }

    fn check_write_text(&self, text: &str) -> std::result::Result<(), String> {
        match WRITE_STAGE_TEXT.find(text) {
            Some(m) => Err(format!("write stage `{}`", m.as_str())),
            None => Ok(()),
        }
    }

    fn check_stages(&self, stages: &[Literal]) -> std::result::Result<(), String> {
        for stage in stages {
            let entries = stage
                .as_object()
                .ok_or_else(|| "pipeline stage is not a document".to_string())?;
            let [(name, _)] = entries else {
                return Err("pipeline stage must name exactly one stage".to_string());
            };
            if self.catalog.is_write_stage(name) {
                return Err(format!("write stage `{}`", name));
            }
            if !self.catalog.is_read_stage(name) {
                return Err(format!("stage `{}` is not allowed", name));
            }
        }
        Ok(())
    }

    /// Nested documents can hide stages (`$lookup` sub-pipelines), so every
    /// key is checked.
    fn check_walk(&self, literal: &Literal) -> std::result::Result<(), String> {
        let mut offending = None;
        literal.walk_keys(&mut |key| {
            if offending.is_none()
                && (self.catalog.is_write_stage(key) || CODE_OPERATORS.contains(&key))
            {
                offending = Some(key.to_string());
            }
        });
        match offending {
            Some(key) => Err(format!("operator `{}` is not allowed", key)),
            None => Ok(()),
        }
    }

    fn check_call(&self, call: &MongoCall) -> std::result::Result<(), String> {
        for arg in call.args.iter().chain(call.modifiers.iter().flat_map(|m| m.args.iter())) {
            self.check_walk(arg)?;
        }

        if call.is_aggregate() {
            if !call.modifiers.is_empty() {
                return Err("aggregate does not take cursor modifiers".to_string());
            }
            return match call.args.as_slice() {
                [pipeline] | [pipeline, Literal::Object(_)] => {
                    let stages = pipeline
                        .as_array()
                        .ok_or_else(|| "aggregate expects a stage array".to_string())?;
                    self.check_stages(stages)
                }
                _ => Err("aggregate expects a stage array".to_string()),
            };
        }

        if !FIND_METHODS.contains(&call.method.as_str()) {
            return Err(format!("method `{}` is not a read", call.method));
        }
        if call.args.len() > 2 || call.args.iter().any(|a| a.as_object().is_none()) {
            return Err("find expects an optional filter and projection document".to_string());
        }
        if let Some(modifier) = call
            .modifiers
            .iter()
            .find(|m| !CURSOR_MODIFIERS.contains(&m.name.as_str()))
        {
            return Err(format!("cursor modifier `{}` is not allowed", modifier.name));
        }
        Ok(())
    }
}

fn first_denied_word(text: &str) -> Option<String> {
    text.to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .find(|token| DENIED_WORDS.contains(token))
        .map(str::to_string)
}

/// Stage list of a pipeline literal: a bare array or `{collection, pipeline}`.
fn pipeline_stages(literal: &Literal) -> std::result::Result<&[Literal], String> {
    match literal {
        Literal::Array(stages) => Ok(stages),
        Literal::Object(entries) => {
            for (key, value) in entries {
                match key.as_str() {
                    "collection" if value.as_str().is_some() => {}
                    "pipeline" => {}
                    other => return Err(format!("unexpected key `{}` in pipeline document", other)),
                }
            }
            literal
                .get("pipeline")
                .and_then(Literal::as_array)
                .ok_or_else(|| "pipeline document needs a `pipeline` array".to_string())
        }
        _ => Err("not a pipeline literal".to_string()),
    }
}

fn check_select(text: &str) -> std::result::Result<(), String> {
    if !text.trim_start().to_ascii_lowercase().starts_with("select") {
        return Err("statement does not start with SELECT".to_string());
    }
    let statements = Parser::parse_sql(&GenericDialect {}, text).map_err(|e| e.to_string())?;
    let [Statement::Query(query)] = statements.as_slice() else {
        return Err("expected exactly one SELECT statement".to_string());
    };
    match query.body.as_ref() {
        SetExpr::Select(select) if select.into.is_none() => Ok(()),
        SetExpr::Select(_) => Err("SELECT ... INTO writes a table".to_string()),
        _ => Err("only a plain SELECT is allowed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(text: &str) -> ValidationVerdict {
        QuerySafetyValidator::new(&SchemaCatalog::inventory()).verdict(text)
    }

    #[test]
    fn test_accepts_read_shapes() {
        for text in [
            "[{ $match: { currentQuantity: { $lt: 10 } } }, { $sort: { currentQuantity: 1 } }]",
            "{ collection: 'suppliers', pipeline: [{ $match: { isActive: true } }] }",
            "db.products.aggregate([{ $group: { _id: '$category', n: { $sum: 1 } } }])",
            "db.products.find({ name: { $regex: 'lamp', $options: 'i' } }, { name: 1 }).sort({ name: 1 }).limit(10)",
            "db.suppliers.countDocuments({ isActive: true })",
            "SELECT * FROM products WHERE current_quantity < minimum_stock_level",
            "select name, updated_at from products where created_at > '2024-01-01';",
        ] {
            let v = verdict(text);
            assert!(v.allowed, "{}: {:?}", text, v.reason);
        }
    }

    #[test]
    fn test_deny_words_reject_every_shape() {
        for text in [
            "[{ $match: { reason: 'DELETE' } }]",
            "db.products.find({}); db.products.drop()",
            "db.products.deleteMany({})",
            "SELECT * FROM products; DROP TABLE products",
            "UPDATE products SET price = 0",
            "db.products.find({ $where: 'exec()' })",
        ] {
            assert!(!verdict(text).allowed, "{}", text);
        }
    }

    #[test]
    fn test_write_stage_rejected_with_spacing() {
        for text in [
            "[{ $match: {} }, { $out: 'copy' }]",
            "[{ $match: {} },\n  {\n    \"$ merge\"  :\n { into: 'x' } }]",
            "db.products.aggregate([{ $replaceWith: '$category' }])",
            "{ collection: 'products', pipeline: [{ $lookup: { from: 'categories', as: 'c', pipeline: [{ $merge: 'x' }] } }] }",
        ] {
            let v = verdict(text);
            assert!(!v.allowed, "{}", text);
        }
    }

    #[test]
    fn test_write_stage_regex_covers_catalog() {
        for stage in SchemaCatalog::inventory().write_stages() {
            assert!(WRITE_STAGE_TEXT.is_match(stage), "{}", stage);
        }
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        for text in [
            "",
            "show collections",
            "db.products.bulkWrite([])",
            "db.products.find({}).forEach(printjson)",
            "[{ $facet: {} }]",
            "[{ $match: {}, $sort: { a: 1 } }]",
            "SELECT a FROM products UNION SELECT b FROM suppliers",
            "SELECT name INTO backup FROM products",
        ] {
            assert!(!verdict(text).allowed, "{:?}", text);
        }
    }

    #[test]
    fn test_validate_raises_unauthorized() {
        let catalog = SchemaCatalog::inventory();
        let err = QuerySafetyValidator::new(&catalog)
            .validate("db.products.insertOne({ name: 'x' })")
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[test]
    fn test_field_names_containing_words_pass() {
        assert!(verdict("db.products.find({}, { createdAt: 1, updatedAt: 1 })").allowed);
    }
}

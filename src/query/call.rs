//! Mongo shell call syntax: `db.<collection>.<method>(<args>)` with
//! optional cursor modifiers such as `.sort({...}).limit(5)`.

use super::literal::{Cursor, Literal, ParseResult};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MongoCall {
    /// Collection as written, before catalog resolution.
    pub collection: Option<String>,
    pub method: String,
    pub args: Vec<Literal>,
    pub modifiers: Vec<CursorModifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorModifier {
    pub name: String,
    pub args: Vec<Literal>,
}

impl MongoCall {
    pub fn is_aggregate(&self) -> bool {
        self.method.eq_ignore_ascii_case("aggregate")
    }
}

/// Parse a whole candidate as one call chain.
pub fn parse_mongo_call(text: &str) -> ParseResult<MongoCall> {
    let mut cursor = Cursor::new(text);
    let mut collection = None;

    let mut name = cursor.parse_identifier()?;
    if name == "db" {
        cursor.expect('.')?;
        let target = cursor.parse_identifier()?;
        if target == "getCollection" || target == "collection" {
            cursor.expect('(')?;
            let args = cursor.parse_arguments()?;
            match args.as_slice() {
                [Literal::String(c)] => collection = Some(c.clone()),
                _ => return Err(cursor.error("getCollection expects one collection name")),
            }
        } else {
            collection = Some(target);
        }
        cursor.expect('.')?;
        name = cursor.parse_identifier()?;
    }

    cursor.expect('(')?;
    let args = cursor.parse_arguments()?;

    let mut modifiers = Vec::new();
    while cursor.eat('.') {
        let modifier = cursor.parse_identifier()?;
        cursor.expect('(')?;
        let modifier_args = cursor.parse_arguments()?;
        modifiers.push(CursorModifier {
            name: modifier,
            args: modifier_args,
        });
    }
    cursor.finish()?;

    Ok(MongoCall {
        collection,
        method: name,
        args,
        modifiers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find_with_modifiers() {
        let call = parse_mongo_call(
            "db.products.find({ price: { $gt: 100 } }, { name: 1 }).sort({ price: -1 }).limit(5);",
        )
        .unwrap();
        assert_eq!(call.collection.as_deref(), Some("products"));
        assert_eq!(call.method, "find");
        assert_eq!(call.args.len(), 2);
        let names: Vec<_> = call.modifiers.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["sort", "limit"]);
    }

    #[test]
    fn test_parse_aggregate_without_db_prefix() {
        let call = parse_mongo_call("aggregate([{ $count: 'total' }])").unwrap();
        assert!(call.collection.is_none());
        assert!(call.is_aggregate());
    }

    #[test]
    fn test_parse_get_collection() {
        let call = parse_mongo_call("db.getCollection('suppliers').find()").unwrap();
        assert_eq!(call.collection.as_deref(), Some("suppliers"));
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_rejects_trailing_statement() {
        assert!(parse_mongo_call("db.products.find({}); db.products.find({})").is_err());
    }
}

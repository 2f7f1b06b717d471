//! Builds the query AST from parsed literals. Stage, query-operator and
//! expression-operator names are closed sets; anything else fails with the
//! offending name as the error fragment.

use super::ast::{
    Accumulator, AccumulatorOp, Condition, Expression, Filter, Operator, Pattern, Projection,
    SortKey, Stage,
};
use super::literal::Literal;
use crate::catalog::SchemaCatalog;
use crate::error::{AssistantError, Result};
use serde_json::Value;

pub fn build_pipeline(literal: &Literal, catalog: &SchemaCatalog) -> Result<Vec<Stage>> {
    let items = literal.as_array().ok_or_else(|| {
        AssistantError::execution("pipeline", "aggregation pipeline must be an array of stages")
    })?;
    items.iter().map(|item| build_stage(item, catalog)).collect()
}

fn build_stage(literal: &Literal, catalog: &SchemaCatalog) -> Result<Stage> {
    let entries = literal
        .as_object()
        .ok_or_else(|| AssistantError::execution("stage", "each stage must be a document"))?;
    let [(name, spec)] = entries else {
        return Err(AssistantError::execution(
            entries.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(","),
            "a stage document must have exactly one stage name",
        ));
    };

    if !catalog.is_read_stage(name) {
        return Err(AssistantError::execution(name.as_str(), "unsupported pipeline stage"));
    }

    match name.as_str() {
        "$match" => Ok(Stage::Match(build_filter(spec)?)),
        "$project" => Ok(Stage::Project(build_projection(spec)?)),
        "$addFields" | "$set" => {
            let fields = object_entries(spec, name)?
                .iter()
                .map(|(k, v)| Ok((k.clone(), build_expression(v)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Stage::AddFields(fields))
        }
        "$unset" => {
            let fields = match spec {
                Literal::String(s) => vec![s.clone()],
                Literal::Array(items) => items
                    .iter()
                    .map(|i| {
                        i.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| AssistantError::execution("$unset", "expects field names"))
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(AssistantError::execution("$unset", "expects field names")),
            };
            Ok(Stage::Unset(fields))
        }
        "$group" => build_group(spec),
        "$sort" => Ok(Stage::Sort(build_sort(spec)?)),
        "$limit" => Ok(Stage::Limit(count_arg(spec, "$limit")?)),
        "$skip" => Ok(Stage::Skip(count_arg(spec, "$skip")?)),
        "$count" => {
            let field = spec
                .as_str()
                .filter(|s| !s.is_empty() && !s.starts_with('$'))
                .ok_or_else(|| AssistantError::execution("$count", "expects an output field name"))?;
            Ok(Stage::Count(field.to_string()))
        }
        "$unwind" => build_unwind(spec),
        "$lookup" => build_lookup(spec, catalog),
        other => Err(AssistantError::execution(other, "unsupported pipeline stage")),
    }
}

fn object_entries<'a>(spec: &'a Literal, stage: &str) -> Result<&'a [(String, Literal)]> {
    spec.as_object()
        .ok_or_else(|| AssistantError::execution(stage, "expects a document"))
}

pub(crate) fn count_arg(spec: &Literal, stage: &str) -> Result<usize> {
    match spec.as_f64() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(AssistantError::execution(stage, "expects a non-negative integer")),
    }
}

fn build_group(spec: &Literal) -> Result<Stage> {
    let entries = object_entries(spec, "$group")?;
    let mut id = None;
    let mut accumulators = Vec::new();

    for (key, value) in entries {
        if key == "_id" {
            id = Some(build_expression(value)?);
            continue;
        }
        let acc = value.as_object().and_then(|e| match e {
            [(op, expr)] => Some((op, expr)),
            _ => None,
        });
        let (op_name, expr) = acc.ok_or_else(|| {
            AssistantError::execution(key.as_str(), "group field must be a single accumulator")
        })?;
        let op = AccumulatorOp::from_name(op_name)
            .ok_or_else(|| AssistantError::execution(op_name.as_str(), "unsupported accumulator"))?;
        let expr = match op {
            AccumulatorOp::Count => Expression::Literal(Value::from(1)),
            _ => build_expression(expr)?,
        };
        accumulators.push((key.clone(), Accumulator { op, expr }));
    }

    let id = id.ok_or_else(|| AssistantError::execution("$group", "missing _id"))?;
    Ok(Stage::Group { id, accumulators })
}

pub(crate) fn build_sort(spec: &Literal) -> Result<Vec<SortKey>> {
    object_entries(spec, "$sort")?
        .iter()
        .map(|(path, dir)| match dir.as_f64() {
            Some(d) if d == 1.0 || d == -1.0 => Ok(SortKey {
                path: path.clone(),
                descending: d < 0.0,
            }),
            _ => Err(AssistantError::execution(path.as_str(), "sort direction must be 1 or -1")),
        })
        .collect()
}

fn build_unwind(spec: &Literal) -> Result<Stage> {
    let (path, preserve_empty) = match spec {
        Literal::String(p) => (p.clone(), false),
        Literal::Object(_) => {
            let path = spec
                .get("path")
                .and_then(Literal::as_str)
                .ok_or_else(|| AssistantError::execution("$unwind", "missing path"))?
                .to_string();
            let preserve = spec
                .get("preserveNullAndEmptyArrays")
                .map(Literal::is_truthy)
                .unwrap_or(false);
            (path, preserve)
        }
        _ => return Err(AssistantError::execution("$unwind", "expects a field path")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| AssistantError::execution(path.as_str(), "unwind path must start with $"))?
        .to_string();
    Ok(Stage::Unwind {
        path,
        preserve_empty,
    })
}

fn build_lookup(spec: &Literal, catalog: &SchemaCatalog) -> Result<Stage> {
    let text = |key: &str| -> Result<String> {
        spec.get(key)
            .and_then(Literal::as_str)
            .map(str::to_string)
            .ok_or_else(|| AssistantError::execution("$lookup", format!("missing '{}'", key)))
    };
    let from_raw = text("from")?;
    let from = catalog
        .resolve_collection(&from_raw)
        .ok_or_else(|| AssistantError::execution(from_raw.as_str(), "unknown collection in $lookup"))?;
    Ok(Stage::Lookup {
        from: from.name.clone(),
        local_field: text("localField")?,
        foreign_field: text("foreignField")?,
        as_field: text("as")?,
    })
}

fn build_projection(spec: &Literal) -> Result<Projection> {
    let entries = object_entries(spec, "$project")?;
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut exclude_id = false;

    for (path, value) in entries {
        match value {
            Literal::Number(_) | Literal::Bool(_) => {
                if value.is_truthy() {
                    include.push((path.clone(), None));
                } else if path == "_id" {
                    exclude_id = true;
                } else {
                    exclude.push(path.clone());
                }
            }
            other => include.push((path.clone(), Some(build_expression(other)?))),
        }
    }

    if !include.is_empty() && !exclude.is_empty() {
        return Err(AssistantError::execution(
            "$project",
            "cannot mix inclusion and exclusion",
        ));
    }
    if include.is_empty() && !exclude.is_empty() {
        if exclude_id {
            exclude.push("_id".to_string());
        }
        return Ok(Projection::Exclude(exclude));
    }
    if include.is_empty() && exclude_id {
        return Ok(Projection::Exclude(vec!["_id".to_string()]));
    }
    Ok(Projection::Include {
        fields: include,
        exclude_id,
    })
}

/// Find-style projection document (`{ name: 1, price: 1 }`).
pub fn build_find_projection(spec: &Literal) -> Result<Option<Projection>> {
    match spec.as_object() {
        Some([]) => Ok(None),
        Some(_) => build_projection(spec).map(Some),
        None => Err(AssistantError::execution("projection", "expects a document")),
    }
}

pub fn build_filter(literal: &Literal) -> Result<Filter> {
    let entries = literal
        .as_object()
        .ok_or_else(|| AssistantError::execution("filter", "filter must be a document"))?;

    let mut clauses = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let clause = match key.as_str() {
            "$and" => Filter::And(filter_list(value, "$and")?),
            "$or" => Filter::Or(filter_list(value, "$or")?),
            "$nor" => Filter::Nor(filter_list(value, "$nor")?),
            "$expr" => Filter::Expr(build_expression(value)?),
            op if op.starts_with('$') => {
                return Err(AssistantError::execution(op, "unsupported query operator"))
            }
            path => Filter::Field {
                path: path.to_string(),
                condition: build_condition(value)?,
            },
        };
        clauses.push(clause);
    }
    Ok(Filter::and(clauses))
}

fn filter_list(value: &Literal, op: &str) -> Result<Vec<Filter>> {
    value
        .as_array()
        .ok_or_else(|| AssistantError::execution(op, "expects an array of filters"))?
        .iter()
        .map(build_filter)
        .collect()
}

fn is_operator_document(value: &Literal) -> bool {
    matches!(value.as_object(), Some(entries) if !entries.is_empty() && entries.iter().all(|(k, _)| k.starts_with('$')))
}

fn build_condition(value: &Literal) -> Result<Condition> {
    if let Literal::Regex { pattern, flags } = value {
        return regex_condition(pattern, flags);
    }
    if !is_operator_document(value) {
        return Ok(Condition::Eq(constant(value, "filter value")?));
    }

    let entries = value.as_object().unwrap_or_default();
    let options = entries
        .iter()
        .find(|(k, _)| k == "$options")
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("");

    let mut conditions = Vec::new();
    for (op, arg) in entries {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(constant(arg, op)?),
            "$ne" => Condition::Ne(constant(arg, op)?),
            "$gt" => Condition::Gt(constant(arg, op)?),
            "$gte" => Condition::Gte(constant(arg, op)?),
            "$lt" => Condition::Lt(constant(arg, op)?),
            "$lte" => Condition::Lte(constant(arg, op)?),
            "$in" => Condition::In(constant_list(arg, op)?),
            "$nin" => Condition::Nin(constant_list(arg, op)?),
            "$exists" => Condition::Exists(arg.is_truthy()),
            "$regex" => match arg {
                Literal::String(p) => regex_condition(p, options)?,
                Literal::Regex { pattern, flags } => {
                    regex_condition(pattern, &format!("{}{}", flags, options))?
                }
                _ => return Err(AssistantError::execution("$regex", "expects a pattern")),
            },
            "$options" => continue,
            "$not" => Condition::Not(Box::new(build_condition(arg)?)),
            other => return Err(AssistantError::execution(other, "unsupported query operator")),
        };
        conditions.push(condition);
    }

    if conditions.is_empty() && entries.iter().any(|(k, _)| k == "$options") {
        return Err(AssistantError::execution("$options", "requires $regex"));
    }
    Ok(match conditions.len() {
        1 => conditions.remove(0),
        _ => Condition::All(conditions),
    })
}

fn regex_condition(pattern: &str, options: &str) -> Result<Condition> {
    Pattern::new(pattern, options)
        .map(Condition::Regex)
        .map_err(|e| AssistantError::execution(pattern, format!("invalid regex: {}", e)))
}

fn constant(value: &Literal, context: &str) -> Result<Value> {
    value
        .to_json()
        .ok_or_else(|| AssistantError::execution(context, "regex is not allowed here"))
}

fn constant_list(value: &Literal, op: &str) -> Result<Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| AssistantError::execution(op, "expects an array"))?
        .iter()
        .map(|v| constant(v, op))
        .collect()
}

pub fn build_expression(literal: &Literal) -> Result<Expression> {
    match literal {
        Literal::String(s) if s.starts_with("$$") => {
            Err(AssistantError::execution(s.as_str(), "pipeline variables are not supported"))
        }
        Literal::String(s) if s.starts_with('$') => Ok(Expression::Field(s[1..].to_string())),
        Literal::Array(items) => Ok(Expression::Array(
            items.iter().map(build_expression).collect::<Result<_>>()?,
        )),
        Literal::Object(entries) => match entries.as_slice() {
            [(name, arg)] if name == "$literal" => Ok(Expression::Literal(constant(arg, "$literal")?)),
            [(name, arg)] if name.starts_with('$') => {
                let op = Operator::from_name(name)
                    .ok_or_else(|| AssistantError::execution(name.as_str(), "unsupported expression operator"))?;
                Ok(Expression::op(op, operator_args(op, arg)?))
            }
            _ => {
                let fields = entries
                    .iter()
                    .map(|(k, v)| {
                        if k.starts_with('$') {
                            Err(AssistantError::execution(k.as_str(), "operator must be the only key"))
                        } else {
                            Ok((k.clone(), build_expression(v)?))
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expression::Object(fields))
            }
        },
        Literal::Regex { pattern, .. } => Err(AssistantError::execution(
            pattern.as_str(),
            "regex is not allowed in expressions",
        )),
        other => Ok(Expression::Literal(constant(other, "expression")?)),
    }
}

fn operator_args(op: Operator, arg: &Literal) -> Result<Vec<Expression>> {
    if op == Operator::Cond {
        if let Some(entries) = arg.as_object() {
            let branch = |key: &str| -> Result<Expression> {
                entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| build_expression(v))
                    .unwrap_or_else(|| Err(AssistantError::execution("$cond", format!("missing '{}'", key))))
            };
            return Ok(vec![branch("if")?, branch("then")?, branch("else")?]);
        }
    }
    match arg {
        Literal::Array(items) => items.iter().map(build_expression).collect(),
        single => Ok(vec![build_expression(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::literal::parse_literal;

    fn pipeline(text: &str) -> Result<Vec<Stage>> {
        build_pipeline(&parse_literal(text).unwrap(), &SchemaCatalog::inventory())
    }

    #[test]
    fn test_build_low_stock_pipeline() {
        let stages = pipeline(
            "[{ $match: { $expr: { $lt: ['$currentQuantity', '$minimumStockLevel'] } } }, { $sort: { currentQuantity: 1 } }, { $limit: 10 }]",
        )
        .unwrap();
        assert_eq!(stages.len(), 3);
        assert!(matches!(&stages[0], Stage::Match(Filter::Expr(Expression::Op { op: Operator::Lt, .. }))));
        assert!(matches!(&stages[2], Stage::Limit(10)));
    }

    #[test]
    fn test_unknown_stage_names_fragment() {
        let err = pipeline("[{ $facet: {} }]").unwrap_err();
        match err {
            AssistantError::ExecutionFailure { fragment, .. } => assert_eq!(fragment, "$facet"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_write_stage_never_builds() {
        assert!(pipeline("[{ $match: {} }, { $out: 'copy' }]").is_err());
        assert!(pipeline("[{ $merge: { into: 'products' } }]").is_err());
    }

    #[test]
    fn test_lookup_resolves_collection_through_catalog() {
        let stages = pipeline(
            "[{ $lookup: { from: 'Supplier', localField: 'supplier', foreignField: '_id', as: 'supplierInfo' } }]",
        )
        .unwrap();
        match &stages[0] {
            Stage::Lookup { from, .. } => assert_eq!(from, "suppliers"),
            other => panic!("unexpected stage: {:?}", other),
        }
        assert!(pipeline("[{ $lookup: { from: 'orders', localField: 'a', foreignField: 'b', as: 'c' } }]").is_err());
    }

    #[test]
    fn test_regex_filter_with_options() {
        let filter = build_filter(&parse_literal("{ name: { $regex: 'acme', $options: 'i' } }").unwrap()).unwrap();
        match filter {
            Filter::Field { path, condition: Condition::Regex(p) } => {
                assert_eq!(path, "name");
                assert!(p.is_match("ACME Supplies"));
            }
            other => panic!("unexpected filter: {:?}", other),
        }
    }

    #[test]
    fn test_options_without_regex_rejected() {
        let err = build_filter(&parse_literal("{ name: { $options: 'i' } }").unwrap()).unwrap_err();
        match err {
            AssistantError::ExecutionFailure { fragment, .. } => assert_eq!(fragment, "$options"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_group_accumulators() {
        let stages = pipeline(
            "[{ $group: { _id: '$category', total: { $sum: '$currentQuantity' }, n: { $count: {} } } }]",
        )
        .unwrap();
        match &stages[0] {
            Stage::Group { accumulators, .. } => {
                assert_eq!(accumulators.len(), 2);
                assert_eq!(accumulators[1].1.op, AccumulatorOp::Count);
            }
            other => panic!("unexpected stage: {:?}", other),
        }
        assert!(pipeline("[{ $group: { _id: null, x: { $median: '$price' } } }]").is_err());
    }

    #[test]
    fn test_mixed_projection_rejected() {
        assert!(pipeline("[{ $project: { name: 1, price: 0 } }]").is_err());
        assert!(pipeline("[{ $project: { name: 1, _id: 0 } }]").is_ok());
    }
}

//! Filter and expression evaluation over schemaless JSON documents.

use crate::error::{AssistantError, Result};
use crate::query::ast::{Condition, Expression, Filter, Operator, Projection};
use crate::query::literal::{number_value, parse_date};
use chrono::Datelike;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Resolve a dotted path. Arrays along the way fan out, so
/// `items.name` over an array of documents yields an array of names.
/// Borrows from `doc` unless a fan-out had to build a new array.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    let mut current = Cow::Borrowed(doc);
    for segment in path.split('.') {
        current = match current {
            Cow::Borrowed(value) => step(value, segment)?,
            Cow::Owned(value) => Cow::Owned(step(&value, segment)?.into_owned()),
        };
    }
    Some(current)
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<Cow<'a, Value>> {
    match value {
        Value::Object(map) => map.get(segment).map(Cow::Borrowed),
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                return items.get(index).map(Cow::Borrowed);
            }
            let collected: Vec<Value> = items
                .iter()
                .filter_map(|item| item.as_object()?.get(segment).cloned())
                .collect();
            if collected.is_empty() {
                None
            } else {
                Some(Cow::Owned(Value::Array(collected)))
            }
        }
        _ => None,
    }
}

/// Write `value` at a dotted path, creating intermediate documents.
pub fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn looks_like_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 10 && bytes[4] == b'-' && bytes[7] == b'-' && bytes[0].is_ascii_digit()
}

/// Ordering between two values of the same kind; `None` when the kinds
/// differ. ISO date strings compare as instants.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            if looks_like_date(x) && looks_like_date(y) {
                if let (Some(dx), Some(dy)) = (parse_date(x), parse_date(y)) {
                    return Some(dx.cmp(&dy));
                }
            }
            Some(x.cmp(y))
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match total_order(l, r) {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        (Value::Object(_), Value::Object(_)) => Some(a.to_string().cmp(&b.to_string())),
        _ => None,
    }
}

/// Total order used by `$sort`, `$min` and `$max`: values of different
/// kinds order by kind.
pub fn total_order(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal)
}

pub fn matches(filter: &Filter, doc: &Value) -> Result<bool> {
    Ok(match filter {
        Filter::All => true,
        Filter::And(filters) => {
            for f in filters {
                if !matches(f, doc)? {
                    return Ok(false);
                }
            }
            true
        }
        Filter::Or(filters) => {
            for f in filters {
                if matches(f, doc)? {
                    return Ok(true);
                }
            }
            false
        }
        Filter::Nor(filters) => {
            for f in filters {
                if matches(f, doc)? {
                    return Ok(false);
                }
            }
            true
        }
        Filter::Field { path, condition } => condition_holds(condition, lookup_path(doc, path).as_deref()),
        Filter::Expr(expr) => truthy(&evaluate(expr, doc)?),
    })
}

/// Array-valued fields match when the array itself or any element does.
fn any_candidate(value: &Value, test: &dyn Fn(&Value) -> bool) -> bool {
    if test(value) {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(test),
        _ => false,
    }
}

fn condition_holds(condition: &Condition, value: Option<&Value>) -> bool {
    let null = Value::Null;
    let present = value.unwrap_or(&null);
    match condition {
        Condition::Eq(expected) => any_candidate(present, &|v| values_equal(v, expected)),
        Condition::Ne(expected) => !any_candidate(present, &|v| values_equal(v, expected)),
        Condition::Gt(bound) => value.is_some_and(|v| ordered(v, bound, |o| o == Ordering::Greater)),
        Condition::Gte(bound) => value.is_some_and(|v| ordered(v, bound, |o| o != Ordering::Less)),
        Condition::Lt(bound) => value.is_some_and(|v| ordered(v, bound, |o| o == Ordering::Less)),
        Condition::Lte(bound) => value.is_some_and(|v| ordered(v, bound, |o| o != Ordering::Greater)),
        Condition::In(options) => {
            any_candidate(present, &|v| options.iter().any(|o| values_equal(v, o)))
        }
        Condition::Nin(options) => {
            !any_candidate(present, &|v| options.iter().any(|o| values_equal(v, o)))
        }
        Condition::Exists(expected) => value.is_some() == *expected,
        Condition::Regex(pattern) => value.is_some_and(|v| {
            any_candidate(v, &|item| item.as_str().is_some_and(|s| pattern.is_match(s)))
        }),
        Condition::Not(inner) => !condition_holds(inner, value),
        Condition::All(conditions) => conditions.iter().all(|c| condition_holds(c, value)),
    }
}

fn ordered(value: &Value, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    any_candidate(value, &|v| compare_values(v, bound).is_some_and(&accept))
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn as_number(value: &Value, op: &str) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(AssistantError::execution(
            op,
            format!("expected a number, found {}", other),
        )),
    }
}

fn numeric_args(values: &[Value], op: &str) -> Result<Option<Vec<f64>>> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        match as_number(v, op)? {
            Some(n) => out.push(n),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

fn expect_arity(args: &[Value], n: usize, op: &str) -> Result<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(AssistantError::execution(
            op,
            format!("expects {} argument(s), got {}", n, args.len()),
        ))
    }
}

pub fn evaluate(expr: &Expression, doc: &Value) -> Result<Value> {
    match expr {
        Expression::Field(path) => Ok(lookup_path(doc, path).map(Cow::into_owned).unwrap_or(Value::Null)),
        Expression::Literal(value) => Ok(value.clone()),
        Expression::Array(items) => Ok(Value::Array(
            items.iter().map(|e| evaluate(e, doc)).collect::<Result<_>>()?,
        )),
        Expression::Object(fields) => {
            let mut map = Map::new();
            for (key, e) in fields {
                map.insert(key.clone(), evaluate(e, doc)?);
            }
            Ok(Value::Object(map))
        }
        Expression::Op { op, args } => evaluate_op(*op, args, doc),
    }
}

fn evaluate_op(op: Operator, args: &[Expression], doc: &Value) -> Result<Value> {
    // $cond short-circuits, so its branches are evaluated lazily.
    if op == Operator::Cond {
        if args.len() != 3 {
            return Err(AssistantError::execution("$cond", "expects if/then/else"));
        }
        let branch = if truthy(&evaluate(&args[0], doc)?) { &args[1] } else { &args[2] };
        return evaluate(branch, doc);
    }

    let values = args
        .iter()
        .map(|e| evaluate(e, doc))
        .collect::<Result<Vec<_>>>()?;
    let name = format!("{:?}", op);

    let compare = |accept: fn(Ordering) -> bool| -> Result<Value> {
        expect_arity(&values, 2, &name)?;
        Ok(Value::Bool(accept(total_order(&values[0], &values[1]))))
    };

    match op {
        Operator::Eq => compare(|o| o == Ordering::Equal),
        Operator::Ne => compare(|o| o != Ordering::Equal),
        Operator::Gt => compare(|o| o == Ordering::Greater),
        Operator::Gte => compare(|o| o != Ordering::Less),
        Operator::Lt => compare(|o| o == Ordering::Less),
        Operator::Lte => compare(|o| o != Ordering::Greater),
        Operator::And => Ok(Value::Bool(values.iter().all(truthy))),
        Operator::Or => Ok(Value::Bool(values.iter().any(truthy))),
        Operator::Not => {
            expect_arity(&values, 1, &name)?;
            Ok(Value::Bool(!truthy(&values[0])))
        }
        Operator::Add | Operator::Multiply => {
            let Some(nums) = numeric_args(&values, &name)? else {
                return Ok(Value::Null);
            };
            let result = if op == Operator::Add {
                nums.iter().sum()
            } else {
                nums.iter().product()
            };
            Ok(number_value(result))
        }
        Operator::Subtract | Operator::Divide | Operator::Mod => {
            expect_arity(&values, 2, &name)?;
            let Some(nums) = numeric_args(&values, &name)? else {
                return Ok(Value::Null);
            };
            let (a, b) = (nums[0], nums[1]);
            match op {
                Operator::Subtract => Ok(number_value(a - b)),
                _ if b == 0.0 => Err(AssistantError::execution(&name, "division by zero")),
                Operator::Divide => Ok(number_value(a / b)),
                _ => Ok(number_value(a % b)),
            }
        }
        Operator::Abs => {
            expect_arity(&values, 1, &name)?;
            Ok(as_number(&values[0], &name)?.map(|n| number_value(n.abs())).unwrap_or(Value::Null))
        }
        Operator::Round => {
            if values.is_empty() || values.len() > 2 {
                return Err(AssistantError::execution(&name, "expects a number and optional places"));
            }
            let places = match values.get(1) {
                Some(v) => as_number(v, "$round")?.unwrap_or(0.0),
                None => 0.0,
            };
            let factor = 10f64.powi(places as i32);
            Ok(as_number(&values[0], &name)?
                .map(|n| number_value((n * factor).round() / factor))
                .unwrap_or(Value::Null))
        }
        Operator::Concat => {
            let mut out = String::new();
            for v in &values {
                match v {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(s),
                    other => {
                        return Err(AssistantError::execution(
                            "$concat",
                            format!("expected strings, found {}", other),
                        ))
                    }
                }
            }
            Ok(Value::String(out))
        }
        Operator::ToLower | Operator::ToUpper => {
            expect_arity(&values, 1, &name)?;
            let text = match &values[0] {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(Value::String(if op == Operator::ToLower {
                text.to_lowercase()
            } else {
                text.to_uppercase()
            }))
        }
        Operator::Size => {
            expect_arity(&values, 1, &name)?;
            match &values[0] {
                Value::Array(items) => Ok(Value::from(items.len())),
                other => Err(AssistantError::execution(
                    "$size",
                    format!("expected an array, found {}", other),
                )),
            }
        }
        Operator::IfNull => Ok(values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        Operator::Year | Operator::Month | Operator::DayOfMonth => {
            expect_arity(&values, 1, &name)?;
            let Some(date) = values[0].as_str().and_then(parse_date) else {
                return Ok(Value::Null);
            };
            Ok(Value::from(match op {
                Operator::Year => date.year() as i64,
                Operator::Month => date.month() as i64,
                _ => date.day() as i64,
            }))
        }
        Operator::Sum | Operator::Avg | Operator::Min | Operator::Max => {
            // In expression position these fold over their arguments,
            // flattening a single array argument.
            let items: Vec<Value> = match values.as_slice() {
                [Value::Array(inner)] => inner.clone(),
                _ => values.clone(),
            };
            Ok(fold_values(op, &items))
        }
        Operator::Cond => unreachable!("handled above"),
    }
}

fn fold_values(op: Operator, items: &[Value]) -> Value {
    let numbers: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
    match op {
        Operator::Sum => number_value(numbers.iter().sum()),
        Operator::Avg if numbers.is_empty() => Value::Null,
        Operator::Avg => number_value(numbers.iter().sum::<f64>() / numbers.len() as f64),
        Operator::Min => items
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| total_order(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        _ => items
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| total_order(a, b))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

pub fn apply_projection(projection: &Projection, doc: &Value) -> Result<Value> {
    let Value::Object(source) = doc else {
        return Ok(doc.clone());
    };
    match projection {
        Projection::Include { fields, exclude_id } => {
            let mut out = Map::new();
            if !exclude_id {
                if let Some(id) = source.get("_id") {
                    out.insert("_id".to_string(), id.clone());
                }
            }
            for (path, computed) in fields {
                let value = match computed {
                    Some(expr) => Some(evaluate(expr, doc)?),
                    None => lookup_path(doc, path).map(Cow::into_owned),
                };
                if let Some(value) = value {
                    set_path(&mut out, path, value);
                }
            }
            Ok(Value::Object(out))
        }
        Projection::Exclude(paths) => {
            let mut out = source.clone();
            for path in paths {
                remove_path(&mut out, path);
            }
            Ok(Value::Object(out))
        }
    }
}

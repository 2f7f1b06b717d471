//! SELECT compiler.
//!
//! Only the subset the model is asked to produce: one table (optionally
//! joined to directly related tables), AND/OR combinations of simple
//! comparisons, a column list, ORDER BY, LIMIT and OFFSET, and `COUNT(*)`.
//! Joins are answered by populating the reference field instead of a
//! relational join.

use super::ast::{Condition, Expression, Filter, FindQuery, Operator, Pattern, Projection, SortKey};
use super::literal::number_value;
use crate::catalog::{EntitySpec, FieldType, Relation, SchemaCatalog};
use crate::error::{AssistantError, Result};
use serde_json::Value;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, ObjectName, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CompiledSelect {
    pub query: FindQuery,
    /// Set for `SELECT COUNT(*)`; the field name of the count document.
    pub count: Option<String>,
}

/// A table in FROM/JOIN and where its fields live in a populated document.
struct Binding<'a> {
    entity: &'a EntitySpec,
    alias: Option<String>,
    /// `None` for the base collection, else the populated reference field.
    prefix: Option<String>,
}

impl Binding<'_> {
    fn answers_to(&self, qualifier: &str) -> bool {
        let q = qualifier.to_lowercase();
        self.alias.as_deref().is_some_and(|a| a.to_lowercase() == q)
            || self.entity.name == q
            || self.entity.aliases.iter().any(|a| *a == q)
    }

    fn path(&self, field: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, field),
            None => field.to_string(),
        }
    }
}

struct Scope<'a> {
    bindings: Vec<Binding<'a>>,
    low_stock: bool,
}

/// A resolved column: its document path and declared type.
struct Column {
    path: String,
    kind: FieldType,
}

enum Operand {
    Column(Column),
    LowStockFlag,
    Value(Value),
}

pub fn compile_select(text: &str, catalog: &SchemaCatalog) -> Result<CompiledSelect> {
    let statements = Parser::parse_sql(&GenericDialect {}, text)
        .map_err(|e| AssistantError::execution("SELECT", e.to_string()))?;
    let [Statement::Query(query)] = statements.as_slice() else {
        return Err(AssistantError::execution(
            "SELECT",
            "expected exactly one SELECT statement",
        ));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(AssistantError::execution(
            "SELECT",
            "set operations and nested queries are not supported",
        ));
    };
    reject_unsupported_clauses(select)?;

    let mut scope = bind_tables(select, catalog)?;
    let base = scope.bindings[0].entity;

    let filter = match &select.selection {
        Some(expr) => compile_predicate(expr, &mut scope)?,
        None => Filter::All,
    };
    let (projection, count) = compile_projection(&select.projection, &scope)?;

    let mut find = FindQuery::all(base.name.clone());
    find.filter = filter;
    find.projection = projection;
    find.populate = populated_relations(&scope);
    find.sort = compile_order(query, &scope)?;
    if find.sort.is_empty() && scope.low_stock {
        if let Some(threshold) = &base.stock_threshold {
            find.sort = vec![SortKey::ascending(threshold.quantity.clone())];
        }
    }
    find.limit = query.limit.as_ref().map(|e| row_count(e, "LIMIT")).transpose()?;
    find.skip = query
        .offset
        .as_ref()
        .map(|o| row_count(&o.value, "OFFSET"))
        .transpose()?;

    debug!(
        "Compiled SELECT on {} (populate: {}, low stock: {})",
        find.collection,
        find.populate.len(),
        scope.low_stock
    );
    Ok(CompiledSelect { query: find, count })
}

fn reject_unsupported_clauses(select: &Select) -> Result<()> {
    if select.distinct.is_some() {
        return Err(AssistantError::execution("DISTINCT", "not supported"));
    }
    let grouped = match &select.group_by {
        GroupByExpr::All => true,
        GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
    };
    if grouped {
        return Err(AssistantError::execution("GROUP BY", "not supported"));
    }
    if select.having.is_some() {
        return Err(AssistantError::execution("HAVING", "not supported"));
    }
    if select.into.is_some() {
        return Err(AssistantError::execution("INTO", "not a read"));
    }
    Ok(())
}

fn table_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn resolve_table<'a>(
    factor: &TableFactor,
    catalog: &'a SchemaCatalog,
) -> Result<(&'a EntitySpec, Option<String>)> {
    let TableFactor::Table { name, alias, .. } = factor else {
        return Err(AssistantError::execution(
            factor.to_string(),
            "only plain table references are supported",
        ));
    };
    let raw = table_name(name);
    let entity = catalog.resolve_collection(&raw).ok_or_else(|| {
        if let Some(suggestion) = catalog.suggest_collection(&raw) {
            warn!("Unknown collection '{}', closest is '{}'", raw, suggestion);
        }
        AssistantError::execution(raw.clone(), "unknown collection")
    })?;
    Ok((entity, alias.as_ref().map(|a| a.name.value.clone())))
}

/// Pick the table that references every other table as the base and
/// populate the rest through its relations.
fn bind_tables<'a>(select: &Select, catalog: &'a SchemaCatalog) -> Result<Scope<'a>> {
    let mut tables = Vec::new();
    for from in &select.from {
        tables.push(resolve_table(&from.relation, catalog)?);
        for join in &from.joins {
            tables.push(resolve_table(&join.relation, catalog)?);
        }
    }
    if tables.is_empty() {
        return Err(AssistantError::execution("FROM", "missing table"));
    }

    let base_index = tables
        .iter()
        .position(|(candidate, _)| {
            tables
                .iter()
                .filter(|(other, _)| other.name != candidate.name)
                .all(|(other, _)| candidate.relation_to(&other.name).is_some())
        })
        .ok_or_else(|| {
            let names: Vec<&str> = tables.iter().map(|(e, _)| e.name.as_str()).collect();
            AssistantError::execution(names.join(" JOIN "), "tables are not directly related")
        })?;

    let (base, base_alias) = tables[base_index].clone();
    let mut bindings = vec![Binding {
        entity: base,
        alias: base_alias,
        prefix: None,
    }];
    for (i, (entity, alias)) in tables.into_iter().enumerate() {
        if i == base_index || entity.name == base.name {
            continue;
        }
        let relation = base.relation_to(&entity.name).ok_or_else(|| {
            AssistantError::execution(entity.name.clone(), "no relation from base table")
        })?;
        bindings.push(Binding {
            entity,
            alias,
            prefix: Some(relation.field.clone()),
        });
    }
    Ok(Scope {
        bindings,
        low_stock: false,
    })
}

fn populated_relations(scope: &Scope<'_>) -> Vec<Relation> {
    let base = scope.bindings[0].entity;
    scope.bindings[1..]
        .iter()
        .filter_map(|b| base.relation_to(&b.entity.name).cloned())
        .collect()
}

fn resolve_operand(expr: &Expr, scope: &Scope<'_>) -> Result<Operand> {
    match expr {
        Expr::Identifier(ident) => resolve_column(None, ident, scope),
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [column] => resolve_column(None, column, scope),
            [.., qualifier, column] => resolve_column(Some(&qualifier.value), column, scope),
            [] => Err(AssistantError::execution("", "empty identifier")),
        },
        Expr::Nested(inner) => resolve_operand(inner, scope),
        Expr::Value(value) => Ok(Operand::Value(sql_value(value)?)),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match resolve_operand(inner, scope)? {
            Operand::Value(Value::Number(n)) => {
                Ok(Operand::Value(number_value(-n.as_f64().unwrap_or(0.0))))
            }
            _ => Err(AssistantError::execution(expr.to_string(), "cannot negate")),
        },
        other => Err(AssistantError::execution(
            other.to_string(),
            "unsupported expression",
        )),
    }
}

fn resolve_column(qualifier: Option<&str>, ident: &Ident, scope: &Scope<'_>) -> Result<Operand> {
    let name = ident.value.as_str();
    let candidates: Vec<&Binding<'_>> = match qualifier {
        Some(q) => {
            let matched: Vec<_> = scope.bindings.iter().filter(|b| b.answers_to(q)).collect();
            if matched.is_empty() {
                return Err(AssistantError::execution(q, "unknown table qualifier"));
            }
            matched
        }
        None => scope.bindings.iter().collect(),
    };

    for binding in candidates {
        if let Some(threshold) = &binding.entity.stock_threshold {
            if binding.prefix.is_none() && name.eq_ignore_ascii_case(&threshold.flag_column) {
                return Ok(Operand::LowStockFlag);
            }
        }
        if let Some(field) = binding.entity.field(name) {
            return Ok(Operand::Column(Column {
                path: binding.path(&field.name),
                kind: field.kind.clone(),
            }));
        }
    }
    Err(AssistantError::execution(name, "unknown column"))
}

fn sql_value(value: &SqlValue) -> Result<Value> {
    Ok(match value {
        SqlValue::Number(text, _) => text
            .parse::<f64>()
            .map(number_value)
            .map_err(|_| AssistantError::execution(text.as_str(), "invalid number"))?,
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => Value::String(s.clone()),
        SqlValue::Boolean(b) => Value::Bool(*b),
        SqlValue::Null => Value::Null,
        other => {
            return Err(AssistantError::execution(
                other.to_string(),
                "unsupported literal",
            ))
        }
    })
}

/// Numeric strings compared against numeric columns become numbers.
fn coerce(value: Value, kind: &FieldType) -> Value {
    match (&value, kind) {
        (Value::String(s), FieldType::Number) => match s.trim().parse::<f64>() {
            Ok(n) => number_value(n),
            Err(_) => value,
        },
        _ => value,
    }
}

fn flip(op: &BinaryOperator) -> BinaryOperator {
    match op {
        BinaryOperator::Lt => BinaryOperator::Gt,
        BinaryOperator::LtEq => BinaryOperator::GtEq,
        BinaryOperator::Gt => BinaryOperator::Lt,
        BinaryOperator::GtEq => BinaryOperator::LtEq,
        other => other.clone(),
    }
}

fn condition(op: &BinaryOperator, value: Value) -> Result<Condition> {
    Ok(match op {
        BinaryOperator::Eq => Condition::Eq(value),
        BinaryOperator::NotEq => Condition::Ne(value),
        BinaryOperator::Lt => Condition::Lt(value),
        BinaryOperator::LtEq => Condition::Lte(value),
        BinaryOperator::Gt => Condition::Gt(value),
        BinaryOperator::GtEq => Condition::Gte(value),
        other => return Err(AssistantError::execution(other.to_string(), "unsupported operator")),
    })
}

fn expression_operator(op: &BinaryOperator) -> Result<Operator> {
    Ok(match op {
        BinaryOperator::Eq => Operator::Eq,
        BinaryOperator::NotEq => Operator::Ne,
        BinaryOperator::Lt => Operator::Lt,
        BinaryOperator::LtEq => Operator::Lte,
        BinaryOperator::Gt => Operator::Gt,
        BinaryOperator::GtEq => Operator::Gte,
        other => return Err(AssistantError::execution(other.to_string(), "unsupported operator")),
    })
}

fn low_stock_filter(scope: &mut Scope<'_>) -> Result<Filter> {
    let base = scope.bindings[0].entity;
    let threshold = base.stock_threshold.as_ref().ok_or_else(|| {
        AssistantError::execution(base.name.clone(), "collection has no stock threshold")
    })?;
    scope.low_stock = true;
    Ok(Filter::Expr(Expression::op(
        Operator::Lt,
        vec![
            Expression::field(threshold.quantity.clone()),
            Expression::field(threshold.minimum.clone()),
        ],
    )))
}

fn is_threshold_pair(scope: &Scope<'_>, op: &BinaryOperator, left: &str, right: &str) -> bool {
    let Some(threshold) = &scope.bindings[0].entity.stock_threshold else {
        return false;
    };
    match op {
        BinaryOperator::Lt => left == threshold.quantity && right == threshold.minimum,
        BinaryOperator::Gt => left == threshold.minimum && right == threshold.quantity,
        _ => false,
    }
}

fn compile_predicate(expr: &Expr, scope: &mut Scope<'_>) -> Result<Filter> {
    match expr {
        Expr::Nested(inner) => compile_predicate(inner, scope),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => Ok(Filter::and(vec![
            compile_predicate(left, scope)?,
            compile_predicate(right, scope)?,
        ])),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => Ok(Filter::Or(vec![
            compile_predicate(left, scope)?,
            compile_predicate(right, scope)?,
        ])),
        Expr::BinaryOp { left, op, right } => {
            let lhs = resolve_operand(left, scope)?;
            let rhs = resolve_operand(right, scope)?;
            compile_comparison(lhs, op, rhs, scope, expr)
        }
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: inner,
        } => Ok(Filter::Nor(vec![compile_predicate(inner, scope)?])),
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::IsTrue(_) => {
            let target = match expr {
                Expr::IsTrue(inner) => inner.as_ref(),
                _ => expr,
            };
            match resolve_operand(target, scope)? {
                Operand::LowStockFlag => low_stock_filter(scope),
                Operand::Column(column) => Ok(Filter::Field {
                    path: column.path,
                    condition: Condition::Eq(Value::Bool(true)),
                }),
                Operand::Value(_) => Err(AssistantError::execution(expr.to_string(), "not a predicate")),
            }
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            let Operand::Column(column) = resolve_operand(inner, scope)? else {
                return Err(AssistantError::execution(expr.to_string(), "expects a column"));
            };
            let condition = if matches!(expr, Expr::IsNull(_)) {
                Condition::Eq(Value::Null)
            } else {
                Condition::Ne(Value::Null)
            };
            Ok(Filter::Field {
                path: column.path,
                condition,
            })
        }
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let Operand::Column(column) = resolve_operand(inner, scope)? else {
                return Err(AssistantError::execution(expr.to_string(), "expects a column"));
            };
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                match resolve_operand(item, scope)? {
                    Operand::Value(v) => values.push(coerce(v, &column.kind)),
                    _ => return Err(AssistantError::execution(item.to_string(), "expects a literal")),
                }
            }
            Ok(Filter::Field {
                path: column.path,
                condition: if *negated {
                    Condition::Nin(values)
                } else {
                    Condition::In(values)
                },
            })
        }
        Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            negated,
            expr: inner,
            pattern,
            ..
        } => {
            let Operand::Column(column) = resolve_operand(inner, scope)? else {
                return Err(AssistantError::execution(expr.to_string(), "expects a column"));
            };
            let Operand::Value(Value::String(like)) = resolve_operand(pattern, scope)? else {
                return Err(AssistantError::execution(expr.to_string(), "expects a string pattern"));
            };
            let regex = like_to_regex(&like);
            let pattern = Pattern::new(&regex, "i")
                .map_err(|e| AssistantError::execution(like.as_str(), e.to_string()))?;
            let condition = Condition::Regex(pattern);
            Ok(Filter::Field {
                path: column.path,
                condition: if *negated {
                    Condition::Not(Box::new(condition))
                } else {
                    condition
                },
            })
        }
        other => Err(AssistantError::execution(
            other.to_string(),
            "unsupported predicate",
        )),
    }
}

fn compile_comparison(
    lhs: Operand,
    op: &BinaryOperator,
    rhs: Operand,
    scope: &mut Scope<'_>,
    expr: &Expr,
) -> Result<Filter> {
    match (lhs, rhs) {
        (Operand::Column(column), Operand::Value(value)) => Ok(Filter::Field {
            condition: condition(op, coerce(value, &column.kind))?,
            path: column.path,
        }),
        (Operand::Value(value), Operand::Column(column)) => Ok(Filter::Field {
            condition: condition(&flip(op), coerce(value, &column.kind))?,
            path: column.path,
        }),
        (Operand::Column(left), Operand::Column(right)) => {
            if is_threshold_pair(scope, op, &left.path, &right.path) {
                return low_stock_filter(scope);
            }
            Ok(Filter::Expr(Expression::op(
                expression_operator(op)?,
                vec![Expression::field(left.path), Expression::field(right.path)],
            )))
        }
        (Operand::LowStockFlag, Operand::Value(value)) | (Operand::Value(value), Operand::LowStockFlag) => {
            let wanted = match (op, &value) {
                (BinaryOperator::Eq, Value::Bool(b)) => *b,
                (BinaryOperator::NotEq, Value::Bool(b)) => !*b,
                (BinaryOperator::Eq, Value::Number(n)) => n.as_f64() != Some(0.0),
                _ => {
                    return Err(AssistantError::execution(
                        expr.to_string(),
                        "low stock flag compares to a boolean",
                    ))
                }
            };
            let filter = low_stock_filter(scope)?;
            if wanted {
                Ok(filter)
            } else {
                scope.low_stock = false;
                Ok(Filter::Nor(vec![filter]))
            }
        }
        _ => Err(AssistantError::execution(
            expr.to_string(),
            "comparison needs a column and a literal",
        )),
    }
}

fn like_to_regex(like: &str) -> String {
    let mut out = String::from("^");
    for ch in like.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn is_count(expr: &Expr) -> bool {
    let Expr::Function(function) = expr else {
        return false;
    };
    table_name(&function.name).eq_ignore_ascii_case("count")
        && matches!(
            function.args.as_slice(),
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)]
                | [FunctionArg::Unnamed(FunctionArgExpr::Expr(_))]
        )
}

fn compile_projection(
    items: &[SelectItem],
    scope: &Scope<'_>,
) -> Result<(Option<Projection>, Option<String>)> {
    let count_item = items.iter().find_map(|item| match item {
        SelectItem::UnnamedExpr(expr) if is_count(expr) => Some("count".to_string()),
        SelectItem::ExprWithAlias { expr, alias } if is_count(expr) => Some(alias.value.clone()),
        _ => None,
    });
    if let Some(alias) = count_item {
        if items.len() > 1 {
            return Err(AssistantError::execution(
                "COUNT",
                "COUNT cannot be combined with other columns without GROUP BY",
            ));
        }
        return Ok((None, Some(alias)));
    }

    let mut fields = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard(_) => return Ok((None, None)),
            SelectItem::QualifiedWildcard(name, _) => {
                let qualifier = table_name(name);
                let binding = scope
                    .bindings
                    .iter()
                    .find(|b| b.answers_to(&qualifier))
                    .ok_or_else(|| AssistantError::execution(qualifier.clone(), "unknown table qualifier"))?;
                match &binding.prefix {
                    None => return Ok((None, None)),
                    Some(prefix) => fields.push((prefix.clone(), None)),
                }
            }
            SelectItem::UnnamedExpr(expr) => fields.push((projected_column(expr, scope)?, None)),
            SelectItem::ExprWithAlias { expr, alias } => {
                let path = projected_column(expr, scope)?;
                fields.push((alias.value.clone(), Some(Expression::field(path))));
            }
        }
    }
    Ok((
        Some(Projection::Include {
            fields,
            exclude_id: false,
        }),
        None,
    ))
}

fn projected_column(expr: &Expr, scope: &Scope<'_>) -> Result<String> {
    match resolve_operand(expr, scope)? {
        Operand::Column(column) => Ok(column.path),
        _ => Err(AssistantError::execution(
            expr.to_string(),
            "only columns can be selected",
        )),
    }
}

fn compile_order(query: &Query, scope: &Scope<'_>) -> Result<Vec<SortKey>> {
    query
        .order_by
        .iter()
        .map(|order| match resolve_operand(&order.expr, scope)? {
            Operand::Column(column) => Ok(SortKey {
                path: column.path,
                descending: order.asc == Some(false),
            }),
            _ => Err(AssistantError::execution(
                order.expr.to_string(),
                "ORDER BY expects a column",
            )),
        })
        .collect()
}

fn row_count(expr: &Expr, clause: &str) -> Result<usize> {
    match expr {
        Expr::Value(SqlValue::Number(text, _)) => text
            .parse::<usize>()
            .map_err(|_| AssistantError::execution(clause, format!("invalid row count {}", text))),
        other => Err(AssistantError::execution(
            clause,
            format!("expects a number, found {}", other),
        )),
    }
}

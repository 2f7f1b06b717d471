//! Tagged query AST. Every variant is a read; there is no way to express
//! a write in these types.

use crate::catalog::Relation;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Match(Filter),
    Project(Projection),
    AddFields(Vec<(String, Expression)>),
    Unset(Vec<String>),
    Group {
        id: Expression,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<SortKey>),
    Limit(usize),
    Skip(usize),
    Count(String),
    Unwind {
        path: String,
        preserve_empty: bool,
    },
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unset(_) => "$unset",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Count(_) => "$count",
            Stage::Unwind { .. } => "$unwind",
            Stage::Lookup { .. } => "$lookup",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

impl SortKey {
    pub fn ascending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Projection {
    /// Keep only these paths (plus `_id` unless excluded). A `Some`
    /// expression computes the value instead of copying it.
    Include {
        fields: Vec<(String, Option<Expression>)>,
        exclude_id: bool,
    },
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, condition: Condition },
    Expr(Expression),
}

impl Filter {
    /// Conjunction that flattens trivial cases.
    pub fn and(mut filters: Vec<Filter>) -> Filter {
        filters.retain(|f| !matches!(f, Filter::All));
        match filters.len() {
            0 => Filter::All,
            1 => filters.remove(0),
            _ => Filter::And(filters),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Pattern),
    Not(Box<Condition>),
    All(Vec<Condition>),
}

/// A compiled regular expression that still serializes as its source.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub source: String,
    pub options: String,
    #[serde(skip)]
    pub regex: Regex,
}

impl Pattern {
    pub fn new(source: &str, options: &str) -> std::result::Result<Self, regex::Error> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(options.contains('i'))
            .multi_line(options.contains('m'))
            .dot_matches_new_line(options.contains('s'))
            .ignore_whitespace(options.contains('x'))
            .build()?;
        Ok(Self {
            source: source.to_string(),
            options: options.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    /// `$path.to.field`
    Field(String),
    Literal(Value),
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Op { op: Operator, args: Vec<Expression> },
}

impl Expression {
    pub fn field(path: impl Into<String>) -> Self {
        Expression::Field(path.into())
    }

    pub fn op(op: Operator, args: Vec<Expression>) -> Self {
        Expression::Op { op, args }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Round,
    Concat,
    ToLower,
    ToUpper,
    Size,
    Cond,
    IfNull,
    Year,
    Month,
    DayOfMonth,
    Sum,
    Avg,
    Min,
    Max,
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$and" => Operator::And,
            "$or" => Operator::Or,
            "$not" => Operator::Not,
            "$add" => Operator::Add,
            "$subtract" => Operator::Subtract,
            "$multiply" => Operator::Multiply,
            "$divide" => Operator::Divide,
            "$mod" => Operator::Mod,
            "$abs" => Operator::Abs,
            "$round" => Operator::Round,
            "$concat" => Operator::Concat,
            "$toLower" => Operator::ToLower,
            "$toUpper" => Operator::ToUpper,
            "$size" => Operator::Size,
            "$cond" => Operator::Cond,
            "$ifNull" => Operator::IfNull,
            "$year" => Operator::Year,
            "$month" => Operator::Month,
            "$dayOfMonth" => Operator::DayOfMonth,
            "$sum" => Operator::Sum,
            "$avg" => Operator::Avg,
            "$min" => Operator::Min,
            "$max" => Operator::Max,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Accumulator {
    pub op: AccumulatorOp,
    pub expr: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
    Push,
    AddToSet,
}

impl AccumulatorOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$count" => AccumulatorOp::Count,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            _ => return None,
        })
    }
}

/// A filtered read with optional reference population, ordering and
/// projection. Applied in that order: populate, filter, sort, skip, limit,
/// project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindQuery {
    pub collection: String,
    pub filter: Filter,
    pub projection: Option<Projection>,
    pub populate: Vec<Relation>,
    pub sort: Vec<SortKey>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Filter::All,
            projection: None,
            populate: Vec::new(),
            sort: Vec::new(),
            skip: None,
            limit: None,
        }
    }
}

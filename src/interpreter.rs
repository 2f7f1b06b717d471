//! Query Interpreter
//!
//! Turns a [`ValidatedQuery`] into a [`StructuredQuery`] and runs it
//! against the document store. Every failure is an `ExecutionFailure`
//! naming the fragment that could not be handled.

use crate::catalog::{EntitySpec, SchemaCatalog};
use crate::error::{AssistantError, Result};
use crate::query::ast::{FindQuery, Projection};
use crate::query::call::{parse_mongo_call, MongoCall};
use crate::query::literal::{parse_literal, Literal};
use crate::query::pipeline::{build_filter, build_find_projection, build_pipeline, build_sort, count_arg};
use crate::query::select::compile_select;
use crate::query::{QueryPlan, QueryShape, StructuredQuery};
use crate::safety::ValidatedQuery;
use crate::store::{DocumentStore, ExecutionResult};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub struct QueryInterpreter<'a> {
    catalog: &'a SchemaCatalog,
    store: &'a dyn DocumentStore,
    /// Target for pipelines that do not name a collection.
    default_collection: Option<&'a str>,
}

impl<'a> QueryInterpreter<'a> {
    pub fn new(
        catalog: &'a SchemaCatalog,
        store: &'a dyn DocumentStore,
        default_collection: Option<&'a str>,
    ) -> Self {
        Self {
            catalog,
            store,
            default_collection,
        }
    }

    pub fn compile(&self, query: &ValidatedQuery) -> Result<StructuredQuery> {
        let text = query.text();
        let plan = match query.shape() {
            QueryShape::AggregationPipeline => self.compile_pipeline_literal(text)?,
            QueryShape::MongoQuery => self.compile_call(text)?,
            QueryShape::DeclarativeSelect => {
                let compiled = compile_select(text, self.catalog)?;
                QueryPlan::Select {
                    query: compiled.query,
                    count: compiled.count,
                }
            }
        };
        Ok(StructuredQuery {
            raw: text.to_string(),
            shape: query.shape(),
            plan,
        })
    }

    pub async fn execute(&self, query: &StructuredQuery) -> Result<ExecutionResult> {
        let rows = match &query.plan {
            QueryPlan::Aggregation { collection, stages } => {
                self.store.aggregate(collection, stages).await?
            }
            QueryPlan::Filter { query, count } | QueryPlan::Select { query, count } => {
                let rows = self.store.find(query).await?;
                match count {
                    Some(field) => vec![count_document(field, rows.len())],
                    None => rows,
                }
            }
        };
        info!(
            "{} on {} returned {} row(s)",
            query.shape.as_str(),
            query.plan.collection(),
            rows.len()
        );
        Ok(ExecutionResult::new(rows))
    }

    pub async fn run(&self, query: &ValidatedQuery) -> Result<(StructuredQuery, ExecutionResult)> {
        let structured = self.compile(query)?;
        let result = self.execute(&structured).await?;
        Ok((structured, result))
    }

    fn resolve(&self, raw: &str) -> Result<&'a EntitySpec> {
        self.catalog.resolve_collection(raw).ok_or_else(|| {
            if let Some(suggestion) = self.catalog.suggest_collection(raw) {
                warn!("Unknown collection '{}', closest is '{}'", raw, suggestion);
            }
            AssistantError::execution(raw, "unknown collection")
        })
    }

    fn default_target(&self) -> Result<&'a EntitySpec> {
        let name = self.default_collection.ok_or_else(|| {
            AssistantError::execution("pipeline", "no target collection and no default configured")
        })?;
        warn!("Pipeline names no collection, defaulting to '{}'", name);
        self.resolve(name)
    }

    fn compile_pipeline_literal(&self, text: &str) -> Result<QueryPlan> {
        let literal = parse_literal(text).map_err(|e| AssistantError::execution("pipeline", e.to_string()))?;
        let (entity, stages) = match &literal {
            Literal::Array(_) => (self.default_target()?, &literal),
            Literal::Object(_) => {
                let entity = match literal.get("collection").and_then(Literal::as_str) {
                    Some(name) => self.resolve(name)?,
                    None => self.default_target()?,
                };
                let stages = literal
                    .get("pipeline")
                    .ok_or_else(|| AssistantError::execution("pipeline", "missing pipeline array"))?;
                (entity, stages)
            }
            _ => return Err(AssistantError::execution("pipeline", "not a pipeline literal")),
        };
        Ok(QueryPlan::Aggregation {
            collection: entity.name.clone(),
            stages: build_pipeline(stages, self.catalog)?,
        })
    }

    fn compile_call(&self, text: &str) -> Result<QueryPlan> {
        let call = parse_mongo_call(text).map_err(|e| AssistantError::execution("call", e.to_string()))?;
        let entity = match &call.collection {
            Some(name) => self.resolve(name)?,
            None => self.default_target()?,
        };

        if call.is_aggregate() {
            let pipeline = call
                .args
                .first()
                .ok_or_else(|| AssistantError::execution("aggregate", "missing pipeline"))?;
            return Ok(QueryPlan::Aggregation {
                collection: entity.name.clone(),
                stages: build_pipeline(pipeline, self.catalog)?,
            });
        }
        compile_find(&call, entity)
    }
}

fn compile_find(call: &MongoCall, entity: &EntitySpec) -> Result<QueryPlan> {
    let mut query = FindQuery::all(entity.name.clone());
    if let Some(filter) = call.args.first() {
        query.filter = build_filter(filter)?;
    }
    query.projection = match call.args.get(1) {
        Some(spec) => build_find_projection(spec)?,
        None => Some(declared_fields(entity)),
    };

    let mut count = None;
    match call.method.as_str() {
        "findOne" => query.limit = Some(1),
        "countDocuments" => count = Some("count".to_string()),
        "find" => {}
        other => return Err(AssistantError::execution(other, "unsupported method")),
    }

    for modifier in &call.modifiers {
        let arg = modifier.args.first();
        match (modifier.name.as_str(), arg) {
            ("sort", Some(spec)) => query.sort = build_sort(spec)?,
            ("limit", Some(n)) => query.limit = Some(count_arg(n, "limit")?),
            ("skip", Some(n)) => query.skip = Some(count_arg(n, "skip")?),
            ("count", _) => count = Some("count".to_string()),
            (name, _) => {
                return Err(AssistantError::execution(
                    name,
                    "unsupported or incomplete cursor modifier",
                ))
            }
        }
    }

    // A count document replaces the rows, so no projection.
    if count.is_some() {
        query.projection = None;
    }
    Ok(QueryPlan::Filter { query, count })
}

/// Projection restricted to the entity's declared fields.
fn declared_fields(entity: &EntitySpec) -> Projection {
    Projection::Include {
        fields: entity
            .fields
            .iter()
            .filter(|f| f.name != "_id")
            .map(|f| (f.name.clone(), None))
            .collect(),
        exclude_id: false,
    }
}

fn count_document(field: &str, n: usize) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), Value::from(n));
    Value::Object(map)
}

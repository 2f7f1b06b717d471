use super::eval::{
    apply_projection, evaluate, lookup_path, matches, remove_path, set_path, total_order,
    values_equal,
};
use super::DocumentStore;
use crate::catalog::Relation;
use crate::error::{AssistantError, Result};
use crate::query::ast::{Accumulator, AccumulatorOp, FindQuery, SortKey, Stage};
use crate::query::literal::number_value;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Read-only document collections held in memory.
///
/// Seeded from a JSON object mapping collection names to arrays of
/// documents. References are stored as the referenced document's `_id`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    collections: HashMap<String, Vec<Value>>,
}

impl InMemoryStore {
    pub fn from_value(seed: Value) -> Result<Self> {
        let Value::Object(map) = seed else {
            return Err(AssistantError::Store(
                "seed must be an object of collection arrays".to_string(),
            ));
        };
        let mut collections = HashMap::new();
        for (name, docs) in map {
            match docs {
                Value::Array(docs) => {
                    collections.insert(name.to_lowercase(), docs);
                }
                _ => {
                    return Err(AssistantError::Store(format!(
                        "collection '{}' must be an array",
                        name
                    )))
                }
            }
        }
        Ok(Self { collections })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let store = Self::from_value(serde_json::from_str(&text)?)?;
        info!(
            "Loaded {} collection(s) from {}",
            store.collections.len(),
            path.display()
        );
        Ok(store)
    }

    /// Documents of a collection; a collection absent from the seed is empty.
    pub fn documents(&self, collection: &str) -> &[Value] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn populate(&self, docs: &mut [Value], relation: &Relation) {
        let targets = self.documents(&relation.target);
        for doc in docs.iter_mut() {
            let Value::Object(map) = doc else { continue };
            let Some(reference) = map.get(&relation.field).cloned() else {
                continue;
            };
            let resolved = targets
                .iter()
                .find(|t| {
                    lookup_path(t, &relation.target_field)
                        .is_some_and(|v| values_equal(&v, &reference))
                })
                .cloned()
                .unwrap_or(Value::Null);
            map.insert(relation.field.clone(), resolved);
        }
    }

    fn run_stage(&self, docs: Vec<Value>, stage: &Stage) -> Result<Vec<Value>> {
        debug!("Running stage {} over {} document(s)", stage.name(), docs.len());
        Ok(match stage {
            Stage::Match(filter) => {
                let mut kept = Vec::new();
                for doc in docs {
                    if matches(filter, &doc)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            Stage::Project(projection) => docs
                .iter()
                .map(|doc| apply_projection(projection, doc))
                .collect::<Result<_>>()?,
            Stage::AddFields(fields) => {
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    let mut computed = Vec::with_capacity(fields.len());
                    for (path, expr) in fields {
                        computed.push((path, evaluate(expr, &doc)?));
                    }
                    let mut doc = doc;
                    if let Value::Object(map) = &mut doc {
                        for (path, value) in computed {
                            set_path(map, path, value);
                        }
                    }
                    out.push(doc);
                }
                out
            }
            Stage::Unset(paths) => docs
                .into_iter()
                .map(|mut doc| {
                    if let Value::Object(map) = &mut doc {
                        for path in paths {
                            remove_path(map, path);
                        }
                    }
                    doc
                })
                .collect(),
            Stage::Group { id, accumulators } => group(docs, id, accumulators)?,
            Stage::Sort(keys) => {
                let mut docs = docs;
                sort_documents(&mut docs, keys);
                docs
            }
            Stage::Limit(n) => docs.into_iter().take(*n).collect(),
            Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
            Stage::Count(field) => {
                let mut map = Map::new();
                map.insert(field.clone(), Value::from(docs.len()));
                vec![Value::Object(map)]
            }
            Stage::Unwind {
                path,
                preserve_empty,
            } => unwind(docs, path, *preserve_empty),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => {
                let foreign = self.documents(from);
                docs.into_iter()
                    .map(|mut doc| {
                        let local = lookup_path(&doc, local_field)
                            .map(Cow::into_owned)
                            .unwrap_or(Value::Null);
                        let joined: Vec<Value> = foreign
                            .iter()
                            .filter(|f| {
                                let other = lookup_path(f, foreign_field);
                                reference_matches(&local, other.as_deref().unwrap_or(&Value::Null))
                            })
                            .cloned()
                            .collect();
                        if let Value::Object(map) = &mut doc {
                            set_path(map, as_field, Value::Array(joined));
                        }
                        doc
                    })
                    .collect()
            }
        })
    }
}

fn reference_matches(local: &Value, foreign: &Value) -> bool {
    match local {
        Value::Array(items) => items.iter().any(|item| values_equal(item, foreign)),
        _ => values_equal(local, foreign),
    }
}

pub(crate) fn sort_documents(docs: &mut [Value], keys: &[SortKey]) {
    docs.sort_by(|a, b| {
        for key in keys {
            let left = lookup_path(a, &key.path);
            let right = lookup_path(b, &key.path);
            let ordering = total_order(
                left.as_deref().unwrap_or(&Value::Null),
                right.as_deref().unwrap_or(&Value::Null),
            );
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn unwind(docs: Vec<Value>, path: &str, preserve_empty: bool) -> Vec<Value> {
    let mut out = Vec::new();
    for doc in docs {
        let target = lookup_path(&doc, path).map(Cow::into_owned);
        match target {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    if let Value::Object(map) = &mut copy {
                        set_path(map, path, item);
                    }
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve_empty {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

fn group(
    docs: Vec<Value>,
    id: &crate::query::ast::Expression,
    accumulators: &[(String, Accumulator)],
) -> Result<Vec<Value>> {
    // Groups keep first-seen order.
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<Vec<Value>>)> = Vec::new();

    for doc in &docs {
        let key = evaluate(id, doc)?;
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            groups.push((key.clone(), vec![Vec::new(); accumulators.len()]));
            groups.len() - 1
        });
        for (i, (_, acc)) in accumulators.iter().enumerate() {
            groups[slot].1[i].push(evaluate(&acc.expr, doc)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, collected)| {
            let mut map = Map::new();
            map.insert("_id".to_string(), key);
            for ((name, acc), values) in accumulators.iter().zip(collected) {
                map.insert(name.clone(), accumulate(acc.op, values));
            }
            Value::Object(map)
        })
        .collect())
}

fn accumulate(op: AccumulatorOp, values: Vec<Value>) -> Value {
    match op {
        AccumulatorOp::Sum => number_value(values.iter().filter_map(Value::as_f64).sum()),
        AccumulatorOp::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AccumulatorOp::Min => values
            .into_iter()
            .filter(|v| !v.is_null())
            .min_by(total_order)
            .unwrap_or(Value::Null),
        AccumulatorOp::Max => values
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(total_order)
            .unwrap_or(Value::Null),
        AccumulatorOp::Count => Value::from(values.len()),
        AccumulatorOp::First => values.into_iter().next().unwrap_or(Value::Null),
        AccumulatorOp::Last => values.into_iter().last().unwrap_or(Value::Null),
        AccumulatorOp::Push => Value::Array(values),
        AccumulatorOp::AddToSet => {
            let mut unique: Vec<Value> = Vec::new();
            for v in values {
                if !unique.iter().any(|u| u == &v) {
                    unique.push(v);
                }
            }
            Value::Array(unique)
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(&self, query: &FindQuery) -> Result<Vec<Value>> {
        let mut docs = self.documents(&query.collection).to_vec();
        for relation in &query.populate {
            self.populate(&mut docs, relation);
        }

        let mut kept = Vec::new();
        for doc in docs {
            if matches(&query.filter, &doc)? {
                kept.push(doc);
            }
        }
        sort_documents(&mut kept, &query.sort);

        let rows = kept
            .into_iter()
            .skip(query.skip.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX));
        match &query.projection {
            Some(projection) => rows.map(|doc| apply_projection(projection, &doc)).collect(),
            None => Ok(rows.collect()),
        }
    }

    async fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Value>> {
        let mut docs = self.documents(collection).to_vec();
        for stage in stages {
            docs = self.run_stage(docs, stage)?;
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use crate::query::literal::parse_literal;
    use crate::query::pipeline::build_pipeline;
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::from_value(json!({
            "categories": [
                { "_id": "c1", "name": "Tools" },
                { "_id": "c2", "name": "Garden" }
            ],
            "products": [
                { "_id": "p1", "name": "Hammer", "category": "c1", "currentQuantity": 5, "minimumStockLevel": 10, "price": 12.5 },
                { "_id": "p2", "name": "Rake", "category": "c2", "currentQuantity": 20, "minimumStockLevel": 10, "price": 20 },
                { "_id": "p3", "name": "Wrench", "category": "c1", "currentQuantity": 0, "minimumStockLevel": 5, "price": 8 }
            ],
            "stockmovements": [
                { "_id": "m1", "product": "p1", "movementType": "in", "quantity": 10 },
                { "_id": "m2", "product": "p1", "movementType": "out", "quantity": 4 },
                { "_id": "m3", "product": "p2", "movementType": "in", "quantity": 7 }
            ]
        }))
        .unwrap()
    }

    async fn run(text: &str, collection: &str) -> Vec<Value> {
        let catalog = SchemaCatalog::inventory();
        let stages = build_pipeline(&parse_literal(text).unwrap(), &catalog).unwrap();
        store().aggregate(collection, &stages).await.unwrap()
    }

    #[tokio::test]
    async fn test_group_by_category_sums_quantity() {
        let rows = run(
            "[{ $group: { _id: '$category', total: { $sum: '$currentQuantity' }, n: { $sum: 1 } } }, { $sort: { total: -1 } }]",
            "products",
        )
        .await;
        assert_eq!(
            rows,
            vec![
                json!({ "_id": "c2", "total": 20, "n": 1 }),
                json!({ "_id": "c1", "total": 5, "n": 2 })
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_and_unwind() {
        let rows = run(
            "[{ $lookup: { from: 'categories', localField: 'category', foreignField: '_id', as: 'cat' } }, { $unwind: '$cat' }, { $match: { 'cat.name': 'Tools' } }, { $project: { name: 1, _id: 0 } }]",
            "products",
        )
        .await;
        assert_eq!(rows, vec![json!({ "name": "Hammer" }), json!({ "name": "Wrench" })]);
    }

    #[tokio::test]
    async fn test_count_stage() {
        let rows = run("[{ $match: { movementType: 'in' } }, { $count: 'inbound' }]", "stockmovements").await;
        assert_eq!(rows, vec![json!({ "inbound": 2 })]);
    }

    #[tokio::test]
    async fn test_add_fields_then_skip_limit() {
        let rows = run(
            "[{ $addFields: { value: { $multiply: ['$price', '$currentQuantity'] } } }, { $sort: { value: -1 } }, { $skip: 1 }, { $limit: 1 }, { $project: { value: 1 } }]",
            "products",
        )
        .await;
        assert_eq!(rows, vec![json!({ "_id": "p1", "value": 62.5 })]);
    }

    #[tokio::test]
    async fn test_find_with_population() {
        let catalog = SchemaCatalog::inventory();
        let products = catalog.resolve_collection("products").unwrap();
        let mut query = FindQuery::all("products");
        query.populate = vec![products.relation_to("categories").unwrap().clone()];
        query.filter = crate::query::pipeline::build_filter(
            &parse_literal("{ 'category.name': 'Garden' }").unwrap(),
        )
        .unwrap();
        let rows = store().find(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["category"]["name"], json!("Garden"));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_empty() {
        let rows = store().find(&FindQuery::all("warehouses")).await.unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rejects_non_array_collection() {
        assert!(InMemoryStore::from_value(json!({ "products": {} })).is_err());
    }
}

//! End-to-end runs of the chat handler against a scripted model and an
//! in-memory store that counts how often it is touched.

use async_trait::async_trait;
use inventory_assistant::chat::{APOLOGY_MESSAGE, REFUSAL_MESSAGE};
use inventory_assistant::config::Environment;
use inventory_assistant::llm::CompletionRequest;
use inventory_assistant::query::ast::{FindQuery, Stage};
use inventory_assistant::{
    AppContext, AssistantConfig, AssistantError, ChatOutcome, ChatRequestHandler, DocumentStore,
    InMemoryStore, ModelClient, QueryShape, Result,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replays queued completions in order; an exhausted queue is an outage.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AssistantError::Llm("service unavailable".to_string()))
    }
}

struct CountingStore {
    inner: InMemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    fn new(inner: InMemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn find(&self, query: &FindQuery) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find(query).await
    }

    async fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.aggregate(collection, stages).await
    }
}

fn fixture() -> InMemoryStore {
    InMemoryStore::from_value(json!({
        "products": [
            { "_id": "p1", "name": "Claw Hammer", "currentQuantity": 5, "minimumStockLevel": 10, "price": 18.5 },
            { "_id": "p2", "name": "Leaf Rake", "currentQuantity": 20, "minimumStockLevel": 10, "price": 24 },
            { "_id": "p3", "name": "Wrench", "currentQuantity": 0, "minimumStockLevel": 5, "price": 21.75 }
        ],
        "suppliers": [
            { "_id": "s1", "name": "Acme Tools", "city": "Chicago", "isActive": true }
        ]
    }))
    .unwrap()
}

struct Harness {
    handler: ChatRequestHandler,
    model: Arc<ScriptedModel>,
    store: Arc<CountingStore>,
}

fn harness(replies: &[&str], environment: Environment) -> Harness {
    harness_with(fixture(), replies, environment)
}

fn harness_with(seed: InMemoryStore, replies: &[&str], environment: Environment) -> Harness {
    let mut config = AssistantConfig::default();
    config.max_attempts = 1;
    config.environment = environment;
    let model = ScriptedModel::new(replies);
    let store = CountingStore::new(seed);
    let ctx = AppContext::new(config, store.clone(), model.clone());
    Harness {
        handler: ChatRequestHandler::new(Arc::new(ctx)),
        model,
        store,
    }
}

fn ids(rows: &[Value]) -> Vec<&str> {
    rows.iter().filter_map(|r| r["_id"].as_str()).collect()
}

fn answered(outcome: ChatOutcome) -> inventory_assistant::ChatResponse {
    match outcome {
        ChatOutcome::Answered(response) => response,
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_low_stock_question_returns_rows_below_minimum() {
    let h = harness(
        &[
            "```sql\nSELECT * FROM products WHERE currentQuantity < minimumStockLevel\n```",
            "Two products are below their minimum: Wrench and Claw Hammer.",
        ],
        Environment::Development,
    );

    let response = answered(h.handler.handle("Which products are low on stock?").await);

    assert!(response.success);
    assert_eq!(ids(response.results.as_deref().unwrap()), vec!["p3", "p1"]);
    let query = response.query.unwrap();
    assert_eq!(query.shape, QueryShape::DeclarativeSelect);
    assert!(!query.raw.contains("```"));
    assert_eq!(response.response, "Two products are below their minimum: Wrench and Claw Hammer.");
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.store.calls(), 1);
}

#[tokio::test]
async fn test_thinking_steps_in_order() {
    let h = harness(&["SELECT name FROM suppliers", "You have one supplier."], Environment::Development);

    let response = answered(h.handler.handle("list my suppliers").await);

    assert_eq!(
        response.thinking,
        vec![
            "Understanding your question...",
            "Analyzing inventory database schema...",
            "Translating to database query...",
            "Validating query safety...",
            "Executing database query...",
            "Formatting results into natural language...",
        ]
    );
    assert_eq!(response.original_message, "list my suppliers");
}

#[tokio::test]
async fn test_select_star_matches_unfiltered_read() {
    let h = harness(&["SELECT * FROM products", "Three products."], Environment::Development);

    let response = answered(h.handler.handle("show every product").await);

    let expected = fixture().documents("products").to_vec();
    assert_eq!(response.results.unwrap(), expected);
}

#[tokio::test]
async fn test_pipeline_answer_uses_aggregation() {
    let h = harness(
        &[
            r#"db.products.aggregate([{ "$match": { "currentQuantity": { "$gt": 0 } } }, { "$sort": { "currentQuantity": -1 } }])"#,
            "Rake and Hammer are in stock.",
        ],
        Environment::Development,
    );

    let response = answered(h.handler.handle("what is in stock, most first?").await);

    assert_eq!(response.query.unwrap().shape, QueryShape::MongoQuery);
    assert_eq!(ids(response.results.as_deref().unwrap()), vec!["p2", "p1"]);
}

#[tokio::test]
async fn test_destructive_question_never_reaches_model_or_store() {
    for question in [
        "delete all products",
        "Please drop the suppliers",
        "remove every record",
        "update all products",
        "truncate the inventory",
        "delete all the products",
        "alter the suppliers table",
        "insert a product",
    ] {
        let h = harness(&["SELECT * FROM products"], Environment::Development);

        let outcome = h.handler.handle(question).await;

        assert_eq!(outcome.status(), 200);
        match outcome {
            ChatOutcome::Refused(response) => {
                assert!(response.success);
                assert_eq!(response.response, REFUSAL_MESSAGE);
                assert!(response.thinking.is_empty());
                assert!(response.results.is_none());
            }
            other => panic!("{}: expected refusal, got {:?}", question, other),
        }
        assert_eq!(h.model.calls(), 0, "{}", question);
        assert_eq!(h.store.calls(), 0, "{}", question);
    }
}

#[tokio::test]
async fn test_write_stage_pipeline_is_refused_before_execution() {
    let h = harness(
        &["[\n  { \"$match\": {} },\n\n    {   \"$out\"  :  \"products_copy\" }\n]"],
        Environment::Development,
    );

    let outcome = h.handler.handle("copy the product list somewhere").await;

    match outcome {
        ChatOutcome::Refused(response) => {
            assert_eq!(response.response, REFUSAL_MESSAGE);
            assert_eq!(response.thinking.len(), 4);
            assert_eq!(response.thinking[3], "Validating query safety...");
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(h.model.calls(), 1);
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn test_generated_write_statement_is_refused() {
    let h = harness(&["UPDATE products SET currentQuantity = 0"], Environment::Development);

    let outcome = h.handler.handle("set the wrench count to zero please").await;

    assert!(matches!(outcome, ChatOutcome::Refused(_)));
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn test_unresolved_collection_is_apology_with_detail() {
    let h = harness(&["SELECT * FROM warehouses"], Environment::Development);

    let outcome = h.handler.handle("list warehouses").await;

    assert_eq!(outcome.status(), 500);
    match outcome {
        ChatOutcome::Failed(failure) => {
            assert!(!failure.success);
            assert_eq!(failure.message, APOLOGY_MESSAGE);
            assert!(failure.error.unwrap().contains("warehouses"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn test_production_hides_error_detail() {
    let h = harness(&["SELECT * FROM warehouses"], Environment::Production);

    let outcome = h.handler.handle("list warehouses").await;

    let body = outcome.to_json().unwrap();
    assert!(body.contains(APOLOGY_MESSAGE));
    assert!(!body.contains("warehouses"));
    assert!(!body.contains("\"error\""));
}

#[tokio::test]
async fn test_model_outage_is_apology() {
    let h = harness(&[], Environment::Development);

    let outcome = h.handler.handle("how many suppliers do we have?").await;

    match outcome {
        ChatOutcome::Failed(failure) => {
            assert!(failure.error.unwrap().starts_with("Translation failure"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn test_narration_outage_is_apology() {
    let h = harness(&["SELECT * FROM products"], Environment::Development);

    let outcome = h.handler.handle("show products").await;

    match outcome {
        ChatOutcome::Failed(failure) => {
            assert!(failure.error.unwrap().starts_with("Narration failure"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.store.calls(), 1);
}

#[tokio::test]
async fn test_seed_file_low_stock() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/inventory.json");
    let seed = InMemoryStore::from_json_file(path).unwrap();
    let h = harness_with(
        seed,
        &[
            "SELECT name, currentQuantity FROM products WHERE currentQuantity < minimumStockLevel",
            "Three items need reordering.",
        ],
        Environment::Development,
    );

    let response = answered(h.handler.handle("what should I reorder?").await);

    let names: Vec<_> = response
        .results
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["Adjustable Wrench 10in", "Claw Hammer 16oz", "Epoxy Glue 50ml"]);
}

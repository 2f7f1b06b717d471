pub mod catalog;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod llm;
pub mod narrator;
pub mod query;
pub mod retry;
pub mod safety;
pub mod server;
pub mod store;
pub mod translator;

pub use catalog::SchemaCatalog;
pub use chat::{ChatOutcome, ChatRequestHandler, ChatResponse, ThinkingStep};
pub use config::AssistantConfig;
pub use context::AppContext;
pub use error::{AssistantError, Result};
pub use interpreter::QueryInterpreter;
pub use llm::{LlmClient, ModelClient};
pub use narrator::ResultNarrator;
pub use query::{QueryPlan, QueryShape, StructuredQuery};
pub use safety::{QuerySafetyValidator, ValidatedQuery, ValidationVerdict};
pub use store::{DocumentStore, ExecutionResult, InMemoryStore};
pub use translator::QueryTranslator;

//! Chat Request Handler
//!
//! Runs one question through screening, translation, validation, execution
//! and narration, recording a thinking step at each transition. Rejections
//! become a polite read-only refusal; every other failure becomes a generic
//! apology with the detail kept server-side.

use crate::context::AppContext;
use crate::error::{AssistantError, Result};
use crate::query::StructuredQuery;
use crate::safety::DENIED_WORDS;
use crate::store::ExecutionResult;
use itertools::Itertools;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const REFUSAL_MESSAGE: &str = "I'm sorry, I can only provide information about your inventory. \
I cannot delete, update, or modify any data. Would you like to view or search for specific inventory items instead?";

pub const APOLOGY_MESSAGE: &str =
    "I encountered an issue processing your request. Could you try asking in a different way?";

/// Verbs that express destructive intent on top of the write deny list.
const DESTRUCTIVE_VERBS: &[&str] = &["remove", "modify", "erase", "wipe", "purge", "destroy"];

const FILLER_WORDS: &str = "a|an|the|all|every|each|any|some|of|one|my|our|this|these|those|from|in|into";

const DOMAIN_NOUNS: &str = "products?|suppliers?|categor(?:y|ies)|items?|records?|entr(?:y|ies)|\
databases?|tables?|collections?|inventory|inventories|stock|stockmovements?|movements?|data";

lazy_static::lazy_static! {
    static ref DESTRUCTIVE_REQUEST: Regex = {
        let verbs = DENIED_WORDS.iter().chain(DESTRUCTIVE_VERBS).join("|");
        Regex::new(&format!(
            r"(?i)\b(?:{})(?:\s+(?:{})){{0,2}}\s+(?:{})\b",
            verbs, FILLER_WORDS, DOMAIN_NOUNS
        ))
        .unwrap()
    };
}

/// True when the message asks to change or destroy inventory data.
pub fn is_destructive_request(message: &str) -> bool {
    DESTRUCTIVE_REQUEST.is_match(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingStep {
    Understanding,
    AnalyzingSchema,
    Translating,
    Validating,
    Executing,
    Narrating,
}

impl ThinkingStep {
    pub fn label(&self) -> &'static str {
        match self {
            ThinkingStep::Understanding => "Understanding your question...",
            ThinkingStep::AnalyzingSchema => "Analyzing inventory database schema...",
            ThinkingStep::Translating => "Translating to database query...",
            ThinkingStep::Validating => "Validating query safety...",
            ThinkingStep::Executing => "Executing database query...",
            ThinkingStep::Narrating => "Formatting results into natural language...",
        }
    }
}

#[derive(Debug, Default)]
struct Trace {
    steps: Vec<ThinkingStep>,
}

impl Trace {
    fn enter(&mut self, step: ThinkingStep) {
        info!("{}", step.label());
        self.steps.push(step);
    }

    fn labels(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.label().to_string()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub success: bool,
    pub original_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<StructuredQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    pub thinking: Vec<String>,
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatFailure {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ChatOutcome {
    Answered(ChatResponse),
    Refused(ChatResponse),
    Failed(ChatFailure),
}

impl ChatOutcome {
    pub fn status(&self) -> u16 {
        match self {
            ChatOutcome::Answered(_) | ChatOutcome::Refused(_) => 200,
            ChatOutcome::Failed(_) => 500,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            ChatOutcome::Answered(r) | ChatOutcome::Refused(r) => serde_json::to_string(r)?,
            ChatOutcome::Failed(f) => serde_json::to_string(f)?,
        })
    }

    /// Text shown to the user, whatever the outcome.
    pub fn reply(&self) -> &str {
        match self {
            ChatOutcome::Answered(r) | ChatOutcome::Refused(r) => &r.response,
            ChatOutcome::Failed(f) => &f.message,
        }
    }
}

struct Answer {
    query: StructuredQuery,
    result: ExecutionResult,
    text: String,
}

pub struct ChatRequestHandler {
    ctx: Arc<AppContext>,
}

impl ChatRequestHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, message: &str) -> ChatOutcome {
        let request_id = Uuid::new_v4();
        let span = info_span!("chat", %request_id);
        self.handle_inner(message).instrument(span).await
    }

    async fn handle_inner(&self, message: &str) -> ChatOutcome {
        info!("Received question ({} chars)", message.chars().count());

        if is_destructive_request(message) {
            warn!("Refusing destructive request before translation");
            return ChatOutcome::Refused(self.refusal(message, Vec::new()));
        }

        let mut trace = Trace::default();
        match self.answer(message, &mut trace).await {
            Ok(answer) => {
                info!("Completed with {} row(s)", answer.result.row_count);
                ChatOutcome::Answered(ChatResponse {
                    success: true,
                    original_message: message.to_string(),
                    query: Some(answer.query),
                    results: Some(answer.result.rows),
                    thinking: trace.labels(),
                    response: answer.text,
                })
            }
            Err(e) if e.is_unauthorized() => {
                warn!("Refusing generated query: {}", e);
                ChatOutcome::Refused(self.refusal(message, trace.labels()))
            }
            Err(e) => {
                if let AssistantError::ExecutionFailure { fragment, reason } = &e {
                    error!("Execution failed at `{}`: {}", fragment, reason);
                } else {
                    error!("Request failed: {}", e);
                }
                ChatOutcome::Failed(ChatFailure {
                    success: false,
                    message: APOLOGY_MESSAGE.to_string(),
                    error: self
                        .ctx
                        .config
                        .environment
                        .exposes_errors()
                        .then(|| e.to_string()),
                })
            }
        }
    }

    async fn answer(&self, message: &str, trace: &mut Trace) -> Result<Answer> {
        trace.enter(ThinkingStep::Understanding);
        trace.enter(ThinkingStep::AnalyzingSchema);
        trace.enter(ThinkingStep::Translating);
        let candidate = self.ctx.translator().translate(message).await?;

        trace.enter(ThinkingStep::Validating);
        let validated = self.ctx.validator().validate(&candidate)?;

        trace.enter(ThinkingStep::Executing);
        let (query, result) = self.ctx.interpreter().run(&validated).await?;

        trace.enter(ThinkingStep::Narrating);
        let text = self
            .ctx
            .narrator()
            .narrate(message, &query.raw, &result)
            .await?;

        Ok(Answer {
            query,
            result,
            text,
        })
    }

    fn refusal(&self, message: &str, thinking: Vec<String>) -> ChatResponse {
        ChatResponse {
            success: true,
            original_message: message.to_string(),
            query: None,
            results: None,
            thinking,
            response: REFUSAL_MESSAGE.to_string(),
        }
    }
}

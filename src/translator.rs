//! Question → candidate query text via the model.

use crate::catalog::SchemaCatalog;
use crate::error::{AssistantError, Result};
use crate::llm::{strip_code_fences, CompletionRequest, ModelClient};
use crate::query::literal::{nesting_depth, MAX_DEPTH};
use crate::retry::RetryPolicy;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You are a database expert that converts natural language questions about an \
inventory into read-only MongoDB queries or SQL SELECT statements. Respond only with the query.";

/// Question plus the schema text it is translated against.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub question: String,
    pub schema: String,
}

impl TranslationRequest {
    pub fn new(question: impl Into<String>, catalog: &SchemaCatalog) -> Self {
        Self {
            question: question.into(),
            schema: catalog.describe(),
        }
    }

    pub fn prompt(&self) -> String {
        format!(
            r#"You are translating natural language questions about an inventory into database queries.

DATABASE SCHEMA:
{schema}

RULES:
- Return ONLY the query, without explanations, comments or markdown.
- Answer in exactly one of these forms:
  1. A MongoDB aggregation pipeline: an array of stages, or {{ collection: '<name>', pipeline: [...] }}.
  2. A MongoDB call: db.<collection>.find(<filter>, <projection>) with optional .sort(), .limit(), .skip() or .count(), or db.<collection>.aggregate([...]).
  3. A single SQL SELECT statement.
- Only read data. NEVER generate INSERT, UPDATE, DELETE, DROP or any other write, and never use $out, $merge, $replaceRoot or $replaceWith.
- Always use lowercase collection names ('products', 'suppliers', 'categories', 'stockmovements').
- For name lookups use a case-insensitive regex: {{ $regex: '<name>', $options: 'i' }}.
- Low stock means currentQuantity < minimumStockLevel, e.g. {{ $expr: {{ $lt: ['$currentQuantity', '$minimumStockLevel'] }} }}.
- For time-based questions use date operations on the date fields.
- The question may be in any language (English, French, Arabic, ...).
- NEVER ask for clarification; make a reasonable assumption instead.

USER QUESTION: "{question}"

QUERY:"#,
            schema = self.schema,
            question = self.question,
        )
    }
}

pub struct QueryTranslator<'a> {
    model: &'a dyn ModelClient,
    catalog: &'a SchemaCatalog,
    retry: &'a RetryPolicy,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(model: &'a dyn ModelClient, catalog: &'a SchemaCatalog, retry: &'a RetryPolicy) -> Self {
        Self {
            model,
            catalog,
            retry,
        }
    }

    pub fn completion_request(&self, question: &str) -> CompletionRequest {
        let request = TranslationRequest::new(question, self.catalog);
        CompletionRequest::new(SYSTEM_PROMPT, request.prompt())
            .temperature(0.1)
            .max_tokens(1500)
    }

    /// Candidate query text with any code fence removed.
    pub async fn translate(&self, question: &str) -> Result<String> {
        let request = self.completion_request(question);
        let (model, request) = (self.model, &request);
        let candidate = self
            .retry
            .run("translation", || async move {
                let raw = model.complete(request).await?;
                let cleaned = strip_code_fences(&raw).trim().to_string();
                if cleaned.is_empty() {
                    return Err(AssistantError::Llm("empty completion".to_string()));
                }
                if nesting_depth(&cleaned) > MAX_DEPTH {
                    return Err(AssistantError::Llm(format!(
                        "completion nests deeper than {} levels",
                        MAX_DEPTH
                    )));
                }
                Ok::<_, AssistantError>(cleaned)
            })
            .await
            .map_err(AssistantError::TranslationFailure)?;

        info!("Translated question into a {} character query", candidate.len());
        debug!("Generated query: {}", candidate);
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        reply: &'static str,
    }

    #[async_trait]
    impl ModelClient for Flaky {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AssistantError::Llm("connection reset".to_string()))
            } else {
                Ok(self.reply.to_string())
            }
        }
    }

    #[test]
    fn test_prompt_embeds_schema_and_question() {
        let catalog = SchemaCatalog::inventory();
        let prompt = TranslationRequest::new("¿Qué productos tienen poco stock?", &catalog).prompt();
        assert!(prompt.contains("minimumStockLevel"));
        assert!(prompt.contains("stockmovements"));
        assert!(prompt.contains("¿Qué productos tienen poco stock?"));
        assert!(prompt.contains("$options: 'i'"));
    }

    #[tokio::test]
    async fn test_translate_strips_fence_after_retry() {
        let catalog = SchemaCatalog::inventory();
        let policy = RetryPolicy::immediate(3);
        let model = Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
            reply: "```sql\nSELECT * FROM products\n```",
        };
        let query = QueryTranslator::new(&model, &catalog, &policy)
            .translate("list products")
            .await
            .unwrap();
        assert_eq!(query, "SELECT * FROM products");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_translate_fails_after_exhausting_attempts() {
        let catalog = SchemaCatalog::inventory();
        let policy = RetryPolicy::immediate(2);
        let model = Flaky {
            failures: 5,
            calls: AtomicUsize::new(0),
            reply: "",
        };
        let err = QueryTranslator::new(&model, &catalog, &policy)
            .translate("list products")
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::TranslationFailure(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_completion_is_retried() {
        let catalog = SchemaCatalog::inventory();
        let policy = RetryPolicy::immediate(3);
        let model = Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            reply: "```\n```",
        };
        let err = QueryTranslator::new(&model, &catalog, &policy)
            .translate("anything")
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::TranslationFailure(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_runaway_nesting_is_translation_failure() {
        let catalog = SchemaCatalog::inventory();
        let policy = RetryPolicy::immediate(2);
        let reply: &'static str = Box::leak("[".repeat(MAX_DEPTH + 1).into_boxed_str());
        let model = Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            reply,
        };
        let err = QueryTranslator::new(&model, &catalog, &policy)
            .translate("anything")
            .await
            .unwrap_err();
        match err {
            AssistantError::TranslationFailure(reason) => assert!(reason.contains("nests deeper")),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}

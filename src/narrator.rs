//! Result Narrator
//!
//! Second model call of a request: explains the rows in the language of
//! the question.

use crate::error::{AssistantError, Result};
use crate::llm::{CompletionRequest, ModelClient};
use crate::retry::RetryPolicy;
use crate::store::ExecutionResult;
use tracing::info;

const SYSTEM_PROMPT: &str =
    "You are a helpful inventory assistant that explains database results clearly.";

pub struct ResultNarrator<'a> {
    model: &'a dyn ModelClient,
    retry: &'a RetryPolicy,
    row_limit: usize,
}

impl<'a> ResultNarrator<'a> {
    pub fn new(model: &'a dyn ModelClient, retry: &'a RetryPolicy, row_limit: usize) -> Self {
        Self {
            model,
            retry,
            row_limit: row_limit.max(1),
        }
    }

    pub fn prompt(&self, question: &str, query: &str, result: &ExecutionResult) -> Result<String> {
        let results = if result.is_empty() {
            "No matching records were found (0 rows).".to_string()
        } else {
            let shown = &result.rows[..result.row_count.min(self.row_limit)];
            let mut text = serde_json::to_string_pretty(shown)?;
            if shown.len() < result.row_count {
                text.push_str(&format!(
                    "\n(showing the first {} of {} rows)",
                    shown.len(),
                    result.row_count
                ));
            }
            text
        };

        Ok(format!(
            r#"You are an inventory assistant that explains database results in natural language.

USER QUESTION: "{question}"

QUERY USED: "{query}"

QUERY RESULTS ({count} rows):
{results}

Provide a clear, concise response that answers the user's question based on these results.
- Match the language of the user's question
- Be direct and informative
- Include relevant numbers and specific product names when appropriate
- Format lists if needed for readability
- If results are empty, say plainly that no matching data was found

YOUR RESPONSE:"#,
            count = result.row_count,
        ))
    }

    pub async fn narrate(&self, question: &str, query: &str, result: &ExecutionResult) -> Result<String> {
        let request = CompletionRequest::new(SYSTEM_PROMPT, self.prompt(question, query, result)?)
            .temperature(0.7)
            .max_tokens(1500);
        let (model, request) = (self.model, &request);

        let text = self
            .retry
            .run("narration", || async move {
                let text = model.complete(request).await?;
                if text.trim().is_empty() {
                    return Err(AssistantError::Llm("empty completion".to_string()));
                }
                Ok::<_, AssistantError>(text.trim().to_string())
            })
            .await
            .map_err(AssistantError::NarrationFailure)?;

        info!("Narrated {} row(s) into {} characters", result.row_count, text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ModelClient for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.user_prompt().to_string());
            assert!((request.temperature - 0.7).abs() < f32::EPSILON);
            if self.fail {
                Err(AssistantError::Llm("503".to_string()))
            } else {
                Ok(" There are 2 products low on stock. ".to_string())
            }
        }
    }

    fn recorder(fail: bool) -> Recorder {
        Recorder {
            prompts: Mutex::new(Vec::new()),
            fail,
        }
    }

    #[test]
    fn test_prompt_marks_empty_results() {
        let model = recorder(false);
        let policy = RetryPolicy::immediate(1);
        let prompt = ResultNarrator::new(&model, &policy, 50)
            .prompt("any expired items?", "[]", &ExecutionResult::new(Vec::new()))
            .unwrap();
        assert!(prompt.contains("No matching records were found"));
        assert!(prompt.contains("(0 rows)"));
    }

    #[test]
    fn test_prompt_caps_rows() {
        let model = recorder(false);
        let policy = RetryPolicy::immediate(1);
        let rows = (0..5).map(|i| json!({ "name": format!("item-{}", i) })).collect();
        let prompt = ResultNarrator::new(&model, &policy, 2)
            .prompt("list items", "db.products.find({})", &ExecutionResult::new(rows))
            .unwrap();
        assert!(prompt.contains("item-1"));
        assert!(!prompt.contains("item-2"));
        assert!(prompt.contains("showing the first 2 of 5 rows"));
    }

    #[tokio::test]
    async fn test_narrate_trims_reply() {
        let model = recorder(false);
        let policy = RetryPolicy::immediate(1);
        let result = ExecutionResult::new(vec![json!({ "name": "Hammer" })]);
        let text = ResultNarrator::new(&model, &policy, 50)
            .narrate("low stock?", "SELECT * FROM products", &result)
            .await
            .unwrap();
        assert_eq!(text, "There are 2 products low on stock.");
        assert!(model.prompts.lock().unwrap()[0].contains("Hammer"));
    }

    #[tokio::test]
    async fn test_narration_failure_after_retries() {
        let model = recorder(true);
        let policy = RetryPolicy::immediate(3);
        let err = ResultNarrator::new(&model, &policy, 50)
            .narrate("q", "SELECT * FROM products", &ExecutionResult::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::NarrationFailure(_)));
        assert_eq!(model.prompts.lock().unwrap().len(), 3);
    }
}

//! Planning capability: initial plans, replans, failure diagnosis and summaries.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::PlannerConfig;
use crate::error::PlanningError;
use crate::types::{ExecutionResult, Plan, StepOutcome};

/// Everything the planner is shown about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub prompt: &'a str,
    pub previous_plan: &'a Plan,
    pub error: &'a str,
    pub page_url: &'a str,
    pub page_title: &'a str,
    pub step_results: &'a [StepOutcome],
    pub dom_snapshot: &'a str,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, prompt: &str) -> Result<Plan, PlanningError>;
    async fn replan(&self, failure: &FailureContext<'_>) -> Result<Plan, PlanningError>;
    async fn diagnose(&self, failure: &FailureContext<'_>) -> Result<String, PlanningError>;
    async fn summarize_execution(
        &self,
        prompt: &str,
        result: &ExecutionResult,
    ) -> Result<String, PlanningError>;
    async fn summarize_plan(&self, prompt: &str, plan: &Plan) -> Result<String, PlanningError>;
}

const PLANNER_PROMPT: &str = r#"You are a browser automation planner. You turn a user's goal into a list of steps a real Chrome browser will execute in order.

Respond with ONLY a JSON object of the form:
{"goal": "short restatement of the goal", "steps": [ ... ]}

Each step is one of:
- {"action":"navigate","url":"https://..."}
- {"action":"click","selector":"css selector"}
- {"action":"type","selector":"css selector","text":"text to fill"}
- {"action":"wait","selector":"css selector","wait_ms":5000}  (selector optional; wait_ms alone pauses)
- {"action":"scroll"}
- {"action":"extract_text","selector":"css selector"}
- {"action":"screenshot"}

Rules:
1. Start with a navigate step unless the goal is about the current page.
2. Prefer stable selectors: ids, names, aria labels, data attributes.
3. Wait for dynamic content before clicking or extracting it.
4. Keep plans minimal. No markdown, no explanation."#;

const DIAGNOSIS_PROMPT: &str = "You debug failed browser automation. In at most three sentences, explain why the failing step failed and what a corrected plan should do differently. Plain text only.";

const SUMMARY_PROMPT: &str = "You report on browser automation for a non-technical user. Answer in at most three plain-text sentences.";

/// Chat-completions backed [`Planner`].
pub struct OpenAiPlanner {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiPlanner {
    pub fn new(config: &PlannerConfig, timeout: Duration) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in environment"))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        })
    }

    async fn complete(&self, system: &str, user: String, json_mode: bool) -> Result<String, PlanningError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let json_resp: Value = response.json().await?;

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(status = status.as_u16(), %message, "planner API error");
            return Err(PlanningError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PlanningError::Malformed(format!("no content in response: {json_resp}")))?;
        debug!(chars = content.len(), "planner replied");
        Ok(content.trim().to_string())
    }

    async fn complete_plan(&self, user: String) -> Result<Plan, PlanningError> {
        let content = self.complete(PLANNER_PROMPT, user, true).await?;
        parse_plan(&content)
    }

    async fn complete_text(&self, system: &str, user: String) -> Result<String, PlanningError> {
        let text = self.complete(system, user, false).await?;
        if text.is_empty() {
            return Err(PlanningError::Malformed("empty completion".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Planner for OpenAiPlanner {
    async fn plan(&self, prompt: &str) -> Result<Plan, PlanningError> {
        self.complete_plan(format!("Goal: {prompt}")).await
    }

    async fn replan(&self, failure: &FailureContext<'_>) -> Result<Plan, PlanningError> {
        let user = format!(
            "{}\n\nProduce a complete replacement plan that avoids this failure. It will run from the current page state, starting at its first step.",
            describe_failure(failure)
        );
        self.complete_plan(user).await
    }

    async fn diagnose(&self, failure: &FailureContext<'_>) -> Result<String, PlanningError> {
        self.complete_text(DIAGNOSIS_PROMPT, describe_failure(failure))
            .await
    }

    async fn summarize_execution(
        &self,
        prompt: &str,
        result: &ExecutionResult,
    ) -> Result<String, PlanningError> {
        let outcome = json!({
            "goal": result.goal,
            "title": result.title,
            "attempts": result.attempts,
            "error": result.error,
            "extracted": result
                .step_results
                .iter()
                .filter(|o| o.action == "extract_text")
                .filter_map(|o| o.text.as_deref())
                .collect::<Vec<_>>(),
        });
        let user = format!(
            "The user asked: {prompt}\n\nExecution outcome:\n{outcome}\n\nSummarize what happened and whether the goal was met."
        );
        self.complete_text(SUMMARY_PROMPT, user).await
    }

    async fn summarize_plan(&self, prompt: &str, plan: &Plan) -> Result<String, PlanningError> {
        let steps = serde_json::to_string(&plan.steps)
            .map_err(|e| PlanningError::Malformed(e.to_string()))?;
        let user = format!(
            "The user asked: {prompt}\n\nPlanned steps:\n{steps}\n\nDescribe what the browser is about to do."
        );
        self.complete_text(SUMMARY_PROMPT, user).await
    }
}

fn describe_failure(failure: &FailureContext<'_>) -> String {
    let plan = serde_json::to_string(failure.previous_plan).unwrap_or_default();
    // Screenshots stay out of the prompt.
    let results: Vec<StepOutcome> = failure
        .step_results
        .iter()
        .map(|o| StepOutcome {
            screenshot_base64: None,
            ..o.clone()
        })
        .collect();
    let results = serde_json::to_string(&results).unwrap_or_default();
    let mut text = format!(
        "Goal: {}\n\nPrevious plan:\n{plan}\n\nError: {}\n\nPage URL: {}\nTitle: {}\n\nStep results:\n{results}",
        failure.prompt, failure.error, failure.page_url, failure.page_title,
    );
    if !failure.dom_snapshot.is_empty() {
        text.push_str("\n\nPage content:\n");
        text.push_str(failure.dom_snapshot);
    }
    text
}

/// Parse a plan out of a completion, tolerating markdown fences and surrounding prose.
pub fn parse_plan(content: &str) -> Result<Plan, PlanningError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    };

    let plan: Plan = serde_json::from_str(json).map_err(|e| {
        warn!(error = %e, "unparsable plan");
        PlanningError::Malformed(format!("failed to parse plan: {e}"))
    })?;
    if plan.steps.is_empty() {
        return Err(PlanningError::Malformed("plan has no steps".into()));
    }
    Ok(plan)
}

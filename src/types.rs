use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// Identifier of a tracked task.
pub type TaskId = u64;

/// A step as the planner emits it: an action tag plus whichever fields it chose to fill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

/// An ordered list of steps plus the goal they serve. Replanning produces a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            goal: goal.into(),
            steps: steps.into_iter().map(StepSpec::from).collect(),
        }
    }
}

/// A validated, executable step. Each variant carries only what its action needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Navigate { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Wait {
        selector: Option<String>,
        wait_ms: Option<u64>,
    },
    Scroll,
    ExtractText { selector: String },
    Screenshot,
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Click { .. } => "click",
            Step::Type { .. } => "type",
            Step::Wait { .. } => "wait",
            Step::Scroll => "scroll",
            Step::ExtractText { .. } => "extract_text",
            Step::Screenshot => "screenshot",
        }
    }
}

fn required(
    value: &Option<String>,
    action: &'static str,
    field: &'static str,
) -> Result<String, StepError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(StepError::InvalidStep { action, field }),
    }
}

impl TryFrom<&StepSpec> for Step {
    type Error = StepError;

    fn try_from(spec: &StepSpec) -> Result<Self, Self::Error> {
        let step = match spec.action.trim() {
            "navigate" | "goto" => Step::Navigate {
                url: required(&spec.url, "navigate", "url")?,
            },
            "click" => Step::Click {
                selector: required(&spec.selector, "click", "selector")?,
            },
            "type" => Step::Type {
                selector: required(&spec.selector, "type", "selector")?,
                text: spec.text.clone().unwrap_or_default(),
            },
            "wait" | "wait_for" => Step::Wait {
                selector: spec.selector.clone().filter(|s| !s.trim().is_empty()),
                wait_ms: spec.wait_ms,
            },
            "scroll" => Step::Scroll,
            "extract_text" => Step::ExtractText {
                selector: required(&spec.selector, "extract_text", "selector")?,
            },
            "screenshot" => Step::Screenshot,
            other => return Err(StepError::UnsupportedAction(other.to_string())),
        };
        Ok(step)
    }
}

impl From<Step> for StepSpec {
    fn from(step: Step) -> Self {
        let action = step.action().to_string();
        match step {
            Step::Navigate { url } => StepSpec {
                action,
                url: Some(url),
                ..Default::default()
            },
            Step::Click { selector } | Step::ExtractText { selector } => StepSpec {
                action,
                selector: Some(selector),
                ..Default::default()
            },
            Step::Type { selector, text } => StepSpec {
                action,
                selector: Some(selector),
                text: Some(text),
                ..Default::default()
            },
            Step::Wait { selector, wait_ms } => StepSpec {
                action,
                selector,
                wait_ms,
                ..Default::default()
            },
            Step::Scroll | Step::Screenshot => StepSpec {
                action,
                ..Default::default()
            },
        }
    }
}

/// The result of applying one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub attempt: u32,
    pub index: usize,
    pub action: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Extracted text for `extract_text`, typed text for `type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 PNG: the requested capture for `screenshot`, the failure capture otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
}

/// What a run hands back to its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub goal: String,
    pub title: String,
    pub steps: Vec<StepSpec>,
    pub step_results: Vec<StepOutcome>,
    pub attempts: u32,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One transition of a streaming run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Plan {
        summary: Option<String>,
        plan: Plan,
    },
    AttemptStart {
        attempt: u32,
    },
    StepStart {
        index: usize,
        step: StepSpec,
    },
    StepResult {
        index: usize,
        outcome: StepOutcome,
    },
    StepError {
        index: usize,
        error: String,
        diagnosis: Option<String>,
        dom_snapshot: Option<String>,
        step_results: Vec<StepOutcome>,
        failure_screenshot_base64: Option<String>,
    },
    Replan(Plan),
    Stopped {
        reason: String,
    },
    Complete(ExecutionResult),
    Error {
        error: String,
        diagnosis: Option<String>,
        plan_summary: Option<String>,
        result: Option<ExecutionResult>,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Plan { .. } => "plan",
            ExecutionEvent::AttemptStart { .. } => "attempt_start",
            ExecutionEvent::StepStart { .. } => "step_start",
            ExecutionEvent::StepResult { .. } => "step_result",
            ExecutionEvent::StepError { .. } => "step_error",
            ExecutionEvent::Replan(_) => "replan",
            ExecutionEvent::Stopped { .. } => "stopped",
            ExecutionEvent::Complete(_) => "complete",
            ExecutionEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Stopped { .. } | ExecutionEvent::Complete(_) | ExecutionEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigate_step_survives_plan_transport() {
        let step = Step::Navigate {
            url: "https://example.com".into(),
        };
        let plan = Plan::new("open example", [step.clone()]);

        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();

        assert_eq!(back, plan);
        assert_eq!(Step::try_from(&back.steps[0]).unwrap(), step);
    }

    #[test]
    fn missing_required_fields_are_invalid_steps() {
        let navigate = StepSpec {
            action: "navigate".into(),
            ..Default::default()
        };
        assert_eq!(
            Step::try_from(&navigate),
            Err(StepError::InvalidStep {
                action: "navigate",
                field: "url"
            })
        );

        let click = StepSpec {
            action: "click".into(),
            selector: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(
            Step::try_from(&click).unwrap_err().kind(),
            "invalid_step"
        );
    }

    #[test]
    fn unknown_tags_are_unsupported() {
        let spec = StepSpec {
            action: "hover".into(),
            selector: Some("#menu".into()),
            ..Default::default()
        };
        assert_eq!(
            Step::try_from(&spec),
            Err(StepError::UnsupportedAction("hover".into()))
        );
    }

    #[test]
    fn legacy_tags_map_to_canonical_actions() {
        let spec: StepSpec =
            serde_json::from_str(r#"{"action":"goto","url":"https://example.com"}"#).unwrap();
        let step = Step::try_from(&spec).unwrap();
        assert_eq!(StepSpec::from(step).action, "navigate");

        let spec: StepSpec =
            serde_json::from_str(r##"{"action":"wait_for","selector":"#ready"}"##).unwrap();
        assert_eq!(
            Step::try_from(&spec).unwrap(),
            Step::Wait {
                selector: Some("#ready".into()),
                wait_ms: None
            }
        );
    }

    #[test]
    fn type_without_text_fills_empty_string() {
        let spec = StepSpec {
            action: "type".into(),
            selector: Some("input[name=q]".into()),
            ..Default::default()
        };
        assert_eq!(
            Step::try_from(&spec).unwrap(),
            Step::Type {
                selector: "input[name=q]".into(),
                text: String::new()
            }
        );
    }

    #[test]
    fn events_serialize_with_name_and_data() {
        let event = ExecutionEvent::AttemptStart { attempt: 2 };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "attempt_start");
        assert_eq!(value["data"]["attempt"], 2);
        assert_eq!(event.name(), "attempt_start");
        assert!(!event.is_terminal());

        let stopped = ExecutionEvent::Stopped {
            reason: "user_requested".into(),
        };
        assert!(stopped.is_terminal());
    }
}

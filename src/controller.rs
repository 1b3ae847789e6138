//! Plan, execute, diagnose, replan.
//!
//! One loop serves both execution modes. [`Orchestrator::run`] drives it to
//! completion and returns the result; [`Orchestrator::run_stream`] drives it
//! on a spawned task, pushing an [`ExecutionEvent`] per transition and checking
//! the session's stop flag before every attempt and every step.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, info, info_span, warn};

use crate::config::AgentConfig;
use crate::driver::{BrowserDriver, BrowserSession};
use crate::error::{PlanningError, RunError};
use crate::executor::StepExecutor;
use crate::planner::{FailureContext, Planner};
use crate::registry::{SessionHandle, SessionProgress, SessionRegistry, StopOutcome};
use crate::snapshot::{capture_page_snapshot, page_location};
use crate::types::{ExecutionEvent, ExecutionResult, Plan, StepOutcome, TaskId};

const EVENT_BUFFER: usize = 32;

/// State owned by one run: the browser session and everything learned so far.
struct SessionState {
    session: Box<dyn BrowserSession>,
    plan: Plan,
    attempts: u32,
    step_results: Vec<StepOutcome>,
    logs: Vec<String>,
    last_error: Option<String>,
    diagnosis: Option<String>,
    dom_snapshot: Option<String>,
    last_screenshot: Option<String>,
}

impl SessionState {
    fn new(session: Box<dyn BrowserSession>, plan: Plan) -> Self {
        Self {
            session,
            plan,
            attempts: 0,
            step_results: Vec::new(),
            logs: Vec::new(),
            last_error: None,
            diagnosis: None,
            dom_snapshot: None,
            last_screenshot: None,
        }
    }

    async fn release(&mut self) {
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "browser session did not close cleanly");
        }
    }
}

enum Exit {
    /// Succeeded, exhausted its attempts, or could not be replanned.
    Finished,
    Stopped,
}

/// Where events go. The synchronous mode has neither a channel nor a stop flag.
struct Events<'a> {
    tx: Option<&'a mpsc::Sender<ExecutionEvent>>,
    handle: Option<&'a SessionHandle>,
}

impl Events<'_> {
    fn silent() -> Self {
        Self {
            tx: None,
            handle: None,
        }
    }

    async fn emit(&self, event: impl FnOnce() -> ExecutionEvent) {
        let Some(tx) = self.tx else { return };
        if tx.send(event()).await.is_err()
            && let Some(handle) = self.handle
            && !handle.stop_requested()
        {
            warn!("event consumer went away; stopping run");
            handle.request_stop();
        }
    }

    fn stop_requested(&self) -> bool {
        self.handle.is_some_and(SessionHandle::stop_requested)
    }

    fn progress(&self, f: impl FnOnce(&mut SessionProgress)) {
        if let Some(handle) = self.handle {
            handle.update(f);
        }
    }
}

pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    driver: Arc<dyn BrowserDriver>,
    config: AgentConfig,
    registry: SessionRegistry,
}

impl Orchestrator {
    pub fn new(planner: Arc<dyn Planner>, driver: Arc<dyn BrowserDriver>, config: AgentConfig) -> Self {
        Self {
            planner,
            driver,
            config,
            registry: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Ask the streaming run registered under `task_id` to stop at its next check.
    pub fn request_stop(&self, task_id: TaskId) -> StopOutcome {
        self.registry.request_stop(task_id)
    }

    /// Run a prompt to completion. Only a failed initial plan or browser launch is
    /// an `Err`; execution failures come back in [`ExecutionResult::error`].
    pub async fn run(&self, prompt: &str) -> Result<ExecutionResult, RunError> {
        let plan = self.bounded(self.planner.plan(prompt)).await?;
        info!(goal = %plan.goal, steps = plan.steps.len(), "plan ready");

        let session = self.driver.open(&self.config).await?;
        let mut state = SessionState::new(session, plan);

        self.drive(prompt, &mut state, &Events::silent()).await;
        let mut result = self.collect(&mut state, None).await;
        state.release().await;
        self.attach_feedback(prompt, &mut result).await;
        Ok(result)
    }

    /// Run a prompt on a background task, yielding one event per transition and
    /// exactly one terminal event (`complete`, `error` or `stopped`).
    pub fn run_stream(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        task_id: TaskId,
    ) -> ReceiverStream<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let prompt = prompt.into();
        tokio::spawn(
            async move { this.stream_task(prompt, task_id, tx).await }
                .instrument(info_span!("task", task_id)),
        );
        ReceiverStream::new(rx)
    }

    async fn stream_task(&self, prompt: String, task_id: TaskId, tx: mpsc::Sender<ExecutionEvent>) {
        let terminal = match self.registry.register(task_id) {
            Ok(guard) => {
                let events = Events {
                    tx: Some(&tx),
                    handle: Some(guard.handle().as_ref()),
                };
                self.stream_run(&prompt, &events).await
                // The guard drops here, so the id is free again before the terminal event.
            }
            Err(e) => {
                warn!(error = %e, "refusing concurrent run");
                failure_event(e.to_string())
            }
        };
        info!(event = terminal.name(), "run finished");
        let _ = tx.send(terminal).await;
    }

    async fn stream_run(&self, prompt: &str, events: &Events<'_>) -> ExecutionEvent {
        let plan = match self.bounded(self.planner.plan(prompt)).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "initial planning failed");
                return failure_event(format!("planning failed: {e}"));
            }
        };
        info!(goal = %plan.goal, steps = plan.steps.len(), "plan ready");

        let plan_summary = self
            .advisory("plan summary", self.planner.summarize_plan(prompt, &plan))
            .await;
        events
            .emit(|| ExecutionEvent::Plan {
                summary: plan_summary.clone(),
                plan: plan.clone(),
            })
            .await;

        if events.stop_requested() {
            return stopped_event();
        }

        let session = match self.driver.open(&self.config).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "browser launch failed");
                return failure_event(format!("failed to open browser session: {e}"));
            }
        };
        let mut state = SessionState::new(session, plan);

        match self.drive(prompt, &mut state, events).await {
            Exit::Stopped => {
                state.release().await;
                info!(attempts = state.attempts, "run stopped on request");
                stopped_event()
            }
            Exit::Finished => {
                let mut result = self.collect(&mut state, plan_summary.clone()).await;
                state.release().await;
                self.attach_feedback(prompt, &mut result).await;
                match result.error.clone() {
                    None => ExecutionEvent::Complete(result),
                    Some(error) => ExecutionEvent::Error {
                        error,
                        diagnosis: result.diagnosis.clone(),
                        plan_summary,
                        result: Some(result),
                    },
                }
            }
        }
    }

    /// The attempt loop. Runs the current plan's steps in order, stops an attempt
    /// at its first failing step, and replaces the plan wholesale before retrying.
    async fn drive(&self, prompt: &str, state: &mut SessionState, events: &Events<'_>) -> Exit {
        let executor = StepExecutor::new(&self.config);
        let max_attempts = self.config.max_attempts.max(1);

        while state.attempts < max_attempts {
            if events.stop_requested() {
                return Exit::Stopped;
            }
            let attempt = state.attempts + 1;
            state.attempts = attempt;
            state.last_error = None;
            // Diagnosis and snapshot describe the error of the attempt that produced them.
            state.diagnosis = None;
            state.dom_snapshot = None;

            info!(attempt, steps = state.plan.steps.len(), "attempt started");
            state.logs.push(format!(
                "[attempt {attempt}] executing {} steps",
                state.plan.steps.len()
            ));
            events.progress(|p| {
                p.attempt = attempt;
                p.goal = state.plan.goal.clone();
                p.step_index = None;
            });
            events.emit(|| ExecutionEvent::AttemptStart { attempt }).await;

            let mut failure = None;
            for (index, spec) in state.plan.steps.iter().enumerate() {
                if events.stop_requested() {
                    return Exit::Stopped;
                }
                events.progress(|p| p.step_index = Some(index));
                events
                    .emit(|| ExecutionEvent::StepStart {
                        index,
                        step: spec.clone(),
                    })
                    .await;

                let outcome = executor
                    .apply(state.session.as_mut(), spec, attempt, index, &mut state.logs)
                    .await;
                state.step_results.push(outcome.clone());

                if outcome.ok {
                    if outcome.screenshot_base64.is_some() {
                        state.last_screenshot = outcome.screenshot_base64.clone();
                    }
                    events
                        .emit(|| ExecutionEvent::StepResult { index, outcome })
                        .await;
                } else {
                    state.last_error = outcome.error.clone();
                    failure = Some((index, outcome.screenshot_base64));
                    break;
                }
            }

            let Some((index, failure_screenshot)) = failure else {
                info!(attempt, "attempt succeeded");
                return Exit::Finished;
            };
            let error = state.last_error.clone().unwrap_or_default();
            events.progress(|p| p.last_error = Some(error.clone()));

            if attempt >= max_attempts {
                info!(attempt, %error, "attempts exhausted");
                events
                    .emit(|| ExecutionEvent::StepError {
                        index,
                        error: error.clone(),
                        diagnosis: None,
                        dom_snapshot: None,
                        step_results: state.step_results.clone(),
                        failure_screenshot_base64: failure_screenshot,
                    })
                    .await;
                break;
            }

            let snapshot = capture_page_snapshot(state.session.as_mut(), &self.config).await;
            let (page_url, page_title) = page_location(state.session.as_mut()).await;
            let context = FailureContext {
                prompt,
                previous_plan: &state.plan,
                error: &error,
                page_url: &page_url,
                page_title: &page_title,
                step_results: &state.step_results,
                dom_snapshot: &snapshot,
            };

            let diagnosis = self
                .advisory("diagnosis", self.planner.diagnose(&context))
                .await;
            if let Some(diagnosis) = &diagnosis {
                state.logs.push(format!("[diagnosis] {diagnosis}"));
            }
            let dom_snapshot = Some(snapshot.clone()).filter(|s| !s.is_empty());
            events
                .emit(|| ExecutionEvent::StepError {
                    index,
                    error: error.clone(),
                    diagnosis: diagnosis.clone(),
                    dom_snapshot: dom_snapshot.clone(),
                    step_results: state.step_results.clone(),
                    failure_screenshot_base64: failure_screenshot,
                })
                .await;

            let replanned = self.bounded(self.planner.replan(&context)).await;
            state.diagnosis = diagnosis;
            state.dom_snapshot = dom_snapshot;

            match replanned {
                Ok(plan) => {
                    info!(attempt, steps = plan.steps.len(), "replanned");
                    state
                        .logs
                        .push(format!("[replan] {} steps", plan.steps.len()));
                    events.emit(|| ExecutionEvent::Replan(plan.clone())).await;
                    state.plan = plan;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "replanning failed");
                    state.logs.push(format!("[replan] failed: {e}"));
                    break;
                }
            }
        }
        Exit::Finished
    }

    /// Assemble the result. The page title is best-effort.
    async fn collect(&self, state: &mut SessionState, plan_summary: Option<String>) -> ExecutionResult {
        let title = state.session.title().await.unwrap_or_else(|e| {
            warn!(error = %e, "page title unavailable");
            String::new()
        });
        ExecutionResult {
            goal: state.plan.goal.clone(),
            title,
            steps: state.plan.steps.clone(),
            step_results: std::mem::take(&mut state.step_results),
            attempts: state.attempts,
            logs: std::mem::take(&mut state.logs),
            error: state.last_error.clone(),
            diagnosis: state.diagnosis.clone(),
            dom_snapshot: state.dom_snapshot.clone(),
            screenshot_base64: state.last_screenshot.clone(),
            plan_summary,
            feedback: None,
        }
    }

    async fn attach_feedback(&self, prompt: &str, result: &mut ExecutionResult) {
        if !self.config.execution_feedback {
            return;
        }
        result.feedback = self
            .advisory(
                "execution summary",
                self.planner.summarize_execution(prompt, result),
            )
            .await;
    }

    /// Bound a planning call by the configured planner timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, PlanningError>>,
    ) -> Result<T, PlanningError> {
        let limit = self.config.planner_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(PlanningError::Timeout(limit)))
    }

    /// A planning call whose failure only costs us the text.
    async fn advisory(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<String, PlanningError>>,
    ) -> Option<String> {
        match self.bounded(call).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "{what} unavailable");
                None
            }
        }
    }
}

fn stopped_event() -> ExecutionEvent {
    ExecutionEvent::Stopped {
        reason: "user_requested".to_string(),
    }
}

fn failure_event(error: String) -> ExecutionEvent {
    ExecutionEvent::Error {
        error,
        diagnosis: None,
        plan_summary: None,
        result: None,
    }
}

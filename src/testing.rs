//! In-memory browser and planner doubles for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::config::AgentConfig;
use crate::driver::{BrowserDriver, BrowserSession, PagePoint};
use crate::error::{DriverError, PlanningError};
use crate::planner::{FailureContext, Planner};
use crate::types::{ExecutionResult, Plan};

#[derive(Debug, Clone)]
pub struct FakeElement {
    pub text: String,
    pub center: Option<PagePoint>,
}

#[derive(Default)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub content: String,
    pub elements: HashMap<String, FakeElement>,
    /// `wait_for_selector` on these selectors blocks until notified.
    pub gates: HashMap<String, Arc<Notify>>,
    pub unreachable: Vec<String>,
    pub fail_content: bool,
    pub fail_screenshot: bool,
    pub fail_title: bool,
    pub calls: Vec<String>,
    pub closed: usize,
}

/// A scripted page. Clones share state, so tests can inspect a session the
/// controller owns.
#[derive(Clone)]
pub struct FakeSession {
    state: Arc<Mutex<PageState>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PageState {
                title: "Blank".into(),
                content: "<html><body></body></html>".into(),
                ..Default::default()
            })),
        }
    }

    pub fn with_element(self, selector: &str, text: &str) -> Self {
        self.state().elements.insert(
            selector.to_string(),
            FakeElement {
                text: text.to_string(),
                center: Some(PagePoint { x: 100.0, y: 50.0 }),
            },
        );
        self
    }

    pub fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls whose name starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    fn element(&self, selector: &str) -> Result<FakeElement, DriverError> {
        self.state()
            .elements
            .get(selector)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(selector.to_string()))
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.record(format!("navigate {url}"));
        let mut state = self.state();
        if state.unreachable.iter().any(|u| u == url) {
            return Err(DriverError::Failed(format!("net::ERR_NAME_NOT_RESOLVED at {url}")));
        }
        state.url = url.to_string();
        Ok(())
    }

    async fn element_center(&mut self, selector: &str) -> Result<Option<PagePoint>, DriverError> {
        self.record(format!("locate {selector}"));
        Ok(self.element(selector)?.center)
    }

    async fn move_mouse(&mut self, to: PagePoint) -> Result<(), DriverError> {
        self.record(format!("move_mouse {:.1},{:.1}", to.x, to.y));
        Ok(())
    }

    async fn click_at(&mut self, at: PagePoint) -> Result<(), DriverError> {
        self.record(format!("click_at {:.1},{:.1}", at.x, at.y));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), DriverError> {
        self.record(format!("click {selector}"));
        self.element(selector).map(|_| ())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), DriverError> {
        self.record(format!("fill {selector}={text}"));
        self.element(selector)?;
        if let Some(element) = self.state().elements.get_mut(selector) {
            element.text = text.to_string();
        }
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        limit: Duration,
    ) -> Result<(), DriverError> {
        self.record(format!("wait {selector}"));
        let gate = self.state().gates.get(selector).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.element(selector)
            .map(|_| ())
            .map_err(|_| DriverError::Timeout {
                operation: "wait for selector",
                limit,
            })
    }

    async fn scroll_viewport(&mut self) -> Result<(), DriverError> {
        self.record("scroll".to_string());
        Ok(())
    }

    async fn inner_text(&mut self, selector: &str) -> Result<String, DriverError> {
        self.record(format!("inner_text {selector}"));
        Ok(self.element(selector)?.text)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        self.record("screenshot".to_string());
        if self.state().fail_screenshot {
            return Err(DriverError::Failed("capture failed".into()));
        }
        Ok(b"\x89PNG".to_vec())
    }

    async fn title(&mut self) -> Result<String, DriverError> {
        self.record("title".to_string());
        let state = self.state();
        if state.fail_title {
            return Err(DriverError::Failed("target closed".into()));
        }
        Ok(state.title.clone())
    }

    async fn url(&mut self) -> Result<String, DriverError> {
        self.record("url".to_string());
        Ok(self.state().url.clone())
    }

    async fn content(&mut self) -> Result<String, DriverError> {
        self.record("content".to_string());
        let state = self.state();
        if state.fail_content {
            return Err(DriverError::Failed("content unavailable".into()));
        }
        Ok(state.content.clone())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.record("close".to_string());
        self.state().closed += 1;
        Ok(())
    }
}

/// Hands out clones of one [`FakeSession`].
pub struct FakeDriver {
    pub session: FakeSession,
    pub fail_open: bool,
    pub opened: AtomicUsize,
}

impl FakeDriver {
    pub fn new(session: FakeSession) -> Self {
        Self {
            session,
            fail_open: false,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn open(&self, _config: &AgentConfig) -> Result<Box<dyn BrowserSession>, DriverError> {
        if self.fail_open {
            return Err(DriverError::Failed("chrome not found".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.session.clone()))
    }
}

/// Returns queued plans in order (initial plan first, then one per replan).
/// A `None` entry, or an empty queue, is a planning failure.
#[derive(Default)]
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Option<Plan>>>,
    pub diagnosis: Option<String>,
    pub summary: Option<String>,
    calls: Mutex<Vec<String>>,
    replan_errors: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    pub fn new(plans: impl IntoIterator<Item = Option<Plan>>) -> Self {
        Self {
            plans: Mutex::new(plans.into_iter().collect()),
            diagnosis: Some("selector did not match anything on the page".into()),
            summary: Some("done".into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == name).count()
    }

    /// Errors the planner was shown when asked to replan.
    pub fn replan_errors(&self) -> Vec<String> {
        self.replan_errors.lock().clone()
    }

    fn next_plan(&self) -> Result<Plan, PlanningError> {
        self.plans
            .lock()
            .pop_front()
            .flatten()
            .ok_or_else(|| PlanningError::Malformed("no plan scripted".into()))
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _prompt: &str) -> Result<Plan, PlanningError> {
        self.calls.lock().push("plan".into());
        self.next_plan()
    }

    async fn replan(&self, failure: &FailureContext<'_>) -> Result<Plan, PlanningError> {
        self.calls.lock().push("replan".into());
        self.replan_errors.lock().push(failure.error.to_string());
        self.next_plan()
    }

    async fn diagnose(&self, _failure: &FailureContext<'_>) -> Result<String, PlanningError> {
        self.calls.lock().push("diagnose".into());
        self.diagnosis
            .clone()
            .ok_or_else(|| PlanningError::Malformed("empty diagnosis".into()))
    }

    async fn summarize_execution(
        &self,
        _prompt: &str,
        _result: &ExecutionResult,
    ) -> Result<String, PlanningError> {
        self.calls.lock().push("summarize_execution".into());
        self.summary
            .clone()
            .ok_or_else(|| PlanningError::Api {
                status: 429,
                message: "quota exceeded".into(),
            })
    }

    async fn summarize_plan(&self, _prompt: &str, _plan: &Plan) -> Result<String, PlanningError> {
        self.calls.lock().push("summarize_plan".into());
        self.summary
            .clone()
            .ok_or_else(|| PlanningError::Api {
                status: 429,
                message: "quota exceeded".into(),
            })
    }
}

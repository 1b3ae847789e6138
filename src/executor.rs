//! Applies one plan step to a live browser session.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::driver::{BrowserSession, PagePoint};
use crate::error::StepError;
use crate::types::{Step, StepOutcome, StepSpec};

/// Interpolated pointer moves per leg of the approach path.
const LEG_STEPS: [usize; 3] = [8, 6, 4];

#[derive(Default)]
struct Performed {
    text: Option<String>,
    screenshot: Option<String>,
}

pub struct StepExecutor<'a> {
    config: &'a AgentConfig,
}

impl<'a> StepExecutor<'a> {
    pub fn new(config: &'a AgentConfig) -> Self {
        Self { config }
    }

    /// Apply `spec` and report how it went. Never fails: every error becomes a
    /// failed outcome, with a failure screenshot attached when configured.
    pub async fn apply(
        &self,
        session: &mut dyn BrowserSession,
        spec: &StepSpec,
        attempt: u32,
        index: usize,
        logs: &mut Vec<String>,
    ) -> StepOutcome {
        let mut outcome = StepOutcome {
            attempt,
            index,
            action: spec.action.clone(),
            url: spec.url.clone(),
            selector: spec.selector.clone(),
            ..Default::default()
        };

        let step = match Step::try_from(spec) {
            Ok(step) => step,
            Err(err) => {
                self.record_failure(&mut outcome, &err, logs);
                return outcome;
            }
        };

        match self.perform(session, &step, logs).await {
            Ok(performed) => {
                outcome.ok = true;
                outcome.text = performed.text;
                outcome.screenshot_base64 = performed.screenshot;
            }
            Err(err) => {
                self.record_failure(&mut outcome, &err, logs);
                if self.config.capture_step_screenshots {
                    outcome.screenshot_base64 = failure_screenshot(session).await;
                }
            }
        }

        if !self.config.slow_mo.is_zero() {
            tokio::time::sleep(self.config.slow_mo).await;
        }
        outcome
    }

    fn record_failure(&self, outcome: &mut StepOutcome, err: &StepError, logs: &mut Vec<String>) {
        warn!(attempt = outcome.attempt, index = outcome.index, action = %outcome.action, error = %err, "step failed");
        logs.push(format!("[error] {err}"));
        outcome.ok = false;
        outcome.error = Some(err.to_string());
        outcome.error_kind = Some(err.kind().to_string());
    }

    async fn perform(
        &self,
        session: &mut dyn BrowserSession,
        step: &Step,
        logs: &mut Vec<String>,
    ) -> Result<Performed, StepError> {
        match step {
            Step::Navigate { url } => {
                logs.push(format!("[navigate] {url}"));
                session.navigate(url).await?;
                Ok(Performed::default())
            }
            Step::Click { selector } => {
                logs.push(format!("[click] {selector}"));
                match session.element_center(selector).await? {
                    Some(center) => humanized_click(session, center).await?,
                    None => session.click(selector).await?,
                }
                Ok(Performed::default())
            }
            Step::Type { selector, text } => {
                logs.push(format!("[type] {selector}"));
                session.fill(selector, text).await?;
                Ok(Performed {
                    text: Some(text.clone()),
                    ..Default::default()
                })
            }
            Step::Wait { selector, wait_ms } => {
                let explicit = wait_ms.map(Duration::from_millis);
                let limit = explicit.unwrap_or(self.config.default_timeout);
                match selector {
                    Some(selector) => {
                        logs.push(format!("[wait] selector {selector}"));
                        session.wait_for_selector(selector, limit).await?;
                    }
                    None => {
                        logs.push(format!("[wait] {}ms", limit.as_millis()));
                        tokio::time::sleep(limit).await;
                    }
                }
                Ok(Performed::default())
            }
            Step::Scroll => {
                logs.push("[scroll]".to_string());
                session.scroll_viewport().await?;
                Ok(Performed::default())
            }
            Step::ExtractText { selector } => {
                logs.push(format!("[extract_text] {selector}"));
                let text = session.inner_text(selector).await?;
                Ok(Performed {
                    text: Some(text),
                    ..Default::default()
                })
            }
            Step::Screenshot => {
                logs.push("[screenshot]".to_string());
                let png = session.screenshot().await?;
                Ok(Performed {
                    screenshot: Some(BASE64.encode(png)),
                    ..Default::default()
                })
            }
        }
    }
}

/// Drift the pointer onto the target in a few jittered legs, then click its center.
async fn humanized_click(
    session: &mut dyn BrowserSession,
    center: PagePoint,
) -> Result<(), StepError> {
    let jitter = rand::random_range(2.0..=6.0);
    debug!(x = center.x, y = center.y, jitter, "humanized click");
    for leg in pointer_path(center, jitter) {
        for point in leg {
            session.move_mouse(point).await?;
        }
        pause().await;
    }
    session.click_at(center).await?;
    Ok(())
}

async fn pause() {
    let ms: u64 = rand::random_range(30..=120);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Three legs: past the target up-left, past it down-right, then onto its center.
pub fn pointer_path(center: PagePoint, jitter: f64) -> Vec<Vec<PagePoint>> {
    let shifted = |d: f64| PagePoint {
        x: center.x + d,
        y: center.y + d,
    };
    let waypoints = [shifted(-jitter), shifted(jitter), center];
    let mut from = shifted(-4.0 * jitter);

    waypoints
        .into_iter()
        .zip(LEG_STEPS)
        .map(|(to, steps)| {
            let leg = (1..=steps)
                .map(|i| {
                    let t = i as f64 / steps as f64;
                    PagePoint {
                        x: from.x + (to.x - from.x) * t,
                        y: from.y + (to.y - from.y) * t,
                    }
                })
                .collect();
            from = to;
            leg
        })
        .collect()
}

async fn failure_screenshot(session: &mut dyn BrowserSession) -> Option<String> {
    match session.screenshot().await {
        Ok(png) => Some(BASE64.encode(png)),
        Err(e) => {
            warn!(error = %e, "failure screenshot unavailable");
            None
        }
    }
}

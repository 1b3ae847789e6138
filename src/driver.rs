//! Browser capability boundary.
//!
//! The executor only ever talks to a [`BrowserSession`]. [`ChromeDriver`] is the
//! real implementation on top of `headless_chrome`: every CDP call is blocking,
//! so each one runs on the blocking pool and is bounded by a configured timeout.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::DriverError;

/// Page coordinates in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PagePoint {
    pub x: f64,
    pub y: f64,
}

/// Opens one browser session per task.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, config: &AgentConfig) -> Result<Box<dyn BrowserSession>, DriverError>;
}

/// A live page. Every operation is independently fallible and bounded.
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate and return once the new document has committed and has a body.
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;
    /// Center of the first matching element; `Ok(None)` when its geometry is unavailable.
    async fn element_center(&mut self, selector: &str) -> Result<Option<PagePoint>, DriverError>;
    async fn move_mouse(&mut self, to: PagePoint) -> Result<(), DriverError>;
    async fn click_at(&mut self, at: PagePoint) -> Result<(), DriverError>;
    async fn click(&mut self, selector: &str) -> Result<(), DriverError>;
    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), DriverError>;
    async fn wait_for_selector(&mut self, selector: &str, limit: Duration)
    -> Result<(), DriverError>;
    async fn scroll_viewport(&mut self) -> Result<(), DriverError>;
    async fn inner_text(&mut self, selector: &str) -> Result<String, DriverError>;
    /// Full-page PNG.
    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError>;
    async fn title(&mut self) -> Result<String, DriverError>;
    async fn url(&mut self) -> Result<String, DriverError>;
    async fn content(&mut self) -> Result<String, DriverError>;
    /// Release the browser. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Launches a dedicated Chrome process for each session.
#[derive(Debug, Default, Clone)]
pub struct ChromeDriver;

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open(&self, config: &AgentConfig) -> Result<Box<dyn BrowserSession>, DriverError> {
        let headless = config.headless;
        let path = config.chrome_path.clone();
        let default_timeout = config.default_timeout;
        let launch_limit = config.navigation_timeout;

        let launch = tokio::task::spawn_blocking(move || -> Result<(Browser, Arc<Tab>), DriverError> {
            let options = LaunchOptions {
                headless,
                path,
                args: vec![
                    OsStr::new("--no-first-run"),
                    OsStr::new("--no-default-browser-check"),
                    OsStr::new("--disable-blink-features=AutomationControlled"),
                    OsStr::new("--disable-infobars"),
                    OsStr::new("--password-store=basic"),
                ],
                idle_browser_timeout: Duration::from_secs(300),
                ..Default::default()
            };

            debug!(headless, "launching chrome");
            let browser = Browser::new(options).map_err(DriverError::failed)?;
            let tab = browser.new_tab().map_err(DriverError::failed)?;
            tab.set_default_timeout(default_timeout);
            Ok((browser, tab))
        });

        let (browser, tab) = match tokio::time::timeout(launch_limit, launch).await {
            Err(_) => {
                return Err(DriverError::Timeout {
                    operation: "browser launch",
                    limit: launch_limit,
                });
            }
            Ok(Err(join)) => return Err(DriverError::failed(format!("browser launch panicked: {join}"))),
            Ok(Ok(launched)) => launched?,
        };

        info!("chrome session ready");
        Ok(Box::new(ChromeSession {
            browser: Some(browser),
            tab,
            default_timeout,
            navigation_timeout: config.navigation_timeout,
            straggler: Straggler::default(),
        }))
    }
}

pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    default_timeout: Duration,
    navigation_timeout: Duration,
    straggler: Straggler,
}

/// A blocking tab call that outlived its timeout. `spawn_blocking` work cannot be
/// cancelled, so the next call on the same tab waits for it instead of overlapping.
#[derive(Default)]
struct Straggler(Option<JoinHandle<()>>);

impl Straggler {
    fn park<T: Send + 'static>(&mut self, task: JoinHandle<T>) {
        self.0 = Some(tokio::spawn(async move {
            let _ = task.await;
        }));
    }

    /// True once nothing parked is still running.
    async fn settle(&mut self, limit: Duration) -> bool {
        let Some(task) = self.0.as_mut() else {
            return true;
        };
        if tokio::time::timeout(limit, task).await.is_err() {
            return false;
        }
        self.0 = None;
        true
    }
}

/// What is left of `limit` since `started`; never zero, so a CDP wait still polls once.
fn remaining(started: Instant, limit: Duration) -> Duration {
    limit
        .saturating_sub(started.elapsed())
        .max(Duration::from_millis(1))
}

impl ChromeSession {
    /// Run a blocking tab operation off the async runtime, bounded by `limit`.
    async fn blocking<T, F>(
        &mut self,
        operation: &'static str,
        limit: Duration,
        f: F,
    ) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, DriverError> + Send + 'static,
    {
        if self.browser.is_none() {
            return Err(DriverError::Failed(format!("{operation}: session is closed")));
        }
        if !self.straggler.settle(self.default_timeout).await {
            return Err(DriverError::Failed(format!(
                "{operation}: an earlier browser operation is still running"
            )));
        }
        let tab = Arc::clone(&self.tab);
        let mut task = tokio::task::spawn_blocking(move || f(tab.as_ref()));
        match tokio::time::timeout(limit, &mut task).await {
            Err(_) => {
                warn!(operation, "browser operation timed out; waiting for it before the next one");
                self.straggler.park(task);
                Err(DriverError::Timeout { operation, limit })
            }
            Ok(Err(join)) => Err(DriverError::failed(format!("{operation} panicked: {join}"))),
            Ok(Ok(result)) => result,
        }
    }

    /// Element lookups wait up to the tab's default timeout on their own.
    fn element_limit(&self) -> Duration {
        self.default_timeout + WAIT_GRACE
    }

    fn evaluate_string(tab: &Tab, expression: &str) -> Result<String, DriverError> {
        let result = tab.evaluate(expression, false).map_err(DriverError::failed)?;
        Ok(result
            .value
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default())
    }
}

/// The grace on top of an explicit wait, so the CDP wait reports its own timeout first.
const WAIT_GRACE: Duration = Duration::from_millis(500);

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        let limit = self.navigation_timeout;
        let default_timeout = self.default_timeout;
        self.blocking("navigate", limit + WAIT_GRACE, move |tab| {
            let started = Instant::now();
            tab.navigate_to(&url).map_err(DriverError::failed)?;
            // `navigate_to` only issues the request; the old document still answers
            // element queries until the new one commits.
            tab.set_default_timeout(remaining(started, limit));
            let navigated = tab.wait_until_navigated().map(|_| ());
            tab.set_default_timeout(default_timeout);
            navigated.map_err(DriverError::failed)?;
            tab.wait_for_element_with_custom_timeout("body", remaining(started, limit))
                .map_err(DriverError::failed)?;
            Ok(())
        })
        .await
    }

    async fn element_center(&mut self, selector: &str) -> Result<Option<PagePoint>, DriverError> {
        let selector = selector.to_string();
        self.blocking("locate element", self.element_limit(), move |tab| {
            let element = tab
                .wait_for_element(&selector)
                .map_err(|_| DriverError::NotFound(selector.clone()))?;
            Ok(element
                .get_midpoint()
                .ok()
                .map(|p| PagePoint { x: p.x, y: p.y }))
        })
        .await
    }

    async fn move_mouse(&mut self, to: PagePoint) -> Result<(), DriverError> {
        self.blocking("move mouse", self.default_timeout, move |tab| {
            tab.move_mouse_to_point(Point { x: to.x, y: to.y })
                .map_err(DriverError::failed)?;
            Ok(())
        })
        .await
    }

    async fn click_at(&mut self, at: PagePoint) -> Result<(), DriverError> {
        self.blocking("click", self.default_timeout, move |tab| {
            tab.click_point(Point { x: at.x, y: at.y })
                .map_err(DriverError::failed)?;
            Ok(())
        })
        .await
    }

    async fn click(&mut self, selector: &str) -> Result<(), DriverError> {
        let selector = selector.to_string();
        self.blocking("click", self.element_limit(), move |tab| {
            let element = tab
                .wait_for_element(&selector)
                .map_err(|_| DriverError::NotFound(selector.clone()))?;
            element.click().map_err(DriverError::failed)?;
            Ok(())
        })
        .await
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), DriverError> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.blocking("fill", self.element_limit(), move |tab| {
            let element = tab
                .wait_for_element(&selector)
                .map_err(|_| DriverError::NotFound(selector.clone()))?;
            element.click().map_err(DriverError::failed)?;
            let js_selector = serde_json::to_string(&selector).map_err(DriverError::failed)?;
            tab.evaluate(
                &format!("document.querySelector({js_selector}).value = ''"),
                false,
            )
            .map_err(DriverError::failed)?;
            if !text.is_empty() {
                tab.type_str(&text).map_err(DriverError::failed)?;
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        limit: Duration,
    ) -> Result<(), DriverError> {
        let selector = selector.to_string();
        self.blocking("wait for selector", limit + WAIT_GRACE, move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, limit)
                .map_err(|_| DriverError::Timeout {
                    operation: "wait for selector",
                    limit,
                })?;
            Ok(())
        })
        .await
    }

    async fn scroll_viewport(&mut self) -> Result<(), DriverError> {
        self.blocking("scroll", self.default_timeout, |tab| {
            tab.evaluate("window.scrollBy(0, window.innerHeight)", false)
                .map_err(DriverError::failed)?;
            Ok(())
        })
        .await
    }

    async fn inner_text(&mut self, selector: &str) -> Result<String, DriverError> {
        let selector = selector.to_string();
        self.blocking("extract text", self.element_limit(), move |tab| {
            let element = tab
                .wait_for_element(&selector)
                .map_err(|_| DriverError::NotFound(selector.clone()))?;
            element.get_inner_text().map_err(DriverError::failed)
        })
        .await
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        self.blocking("screenshot", self.navigation_timeout, |tab| {
            let size = Self::evaluate_string(
                tab,
                "JSON.stringify([document.documentElement.scrollWidth, document.documentElement.scrollHeight])",
            )?;
            let clip = serde_json::from_str::<(f64, f64)>(&size)
                .ok()
                .filter(|(w, h)| *w > 0.0 && *h > 0.0)
                .map(|(width, height)| Page::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width,
                    height,
                    scale: 1.0,
                });
            let shot = tab
                .call_method(Page::CaptureScreenshot {
                    format: Some(Page::CaptureScreenshotFormatOption::Png),
                    quality: None,
                    clip,
                    from_surface: Some(true),
                    capture_beyond_viewport: Some(true),
                    optimize_for_speed: None,
                })
                .map_err(DriverError::failed)?;
            BASE64.decode(shot.data).map_err(DriverError::failed)
        })
        .await
    }

    async fn title(&mut self) -> Result<String, DriverError> {
        self.blocking("page title", self.default_timeout, |tab| {
            tab.get_title().map_err(DriverError::failed)
        })
        .await
    }

    async fn url(&mut self) -> Result<String, DriverError> {
        self.blocking("page url", self.default_timeout, |tab| Ok(tab.get_url()))
            .await
    }

    async fn content(&mut self) -> Result<String, DriverError> {
        self.blocking("page content", self.default_timeout, |tab| {
            tab.get_content().map_err(DriverError::failed)
        })
        .await
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.browser.is_none() {
            return Ok(());
        }
        if !self.straggler.settle(self.default_timeout).await {
            warn!("closing while an earlier browser operation is still running");
        }
        let Some(browser) = self.browser.take() else {
            return Ok(());
        };
        let tab = Arc::clone(&self.tab);
        let closed = tokio::task::spawn_blocking(move || {
            let result = tab.close(false);
            drop(browser);
            result
        });
        match tokio::time::timeout(self.default_timeout, closed).await {
            Ok(Ok(Ok(_))) => {
                debug!("chrome session closed");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(DriverError::failed(e)),
            Ok(Err(join)) => Err(DriverError::failed(format!("close panicked: {join}"))),
            Err(_) => Err(DriverError::Timeout {
                operation: "close",
                limit: self.default_timeout,
            }),
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if self.browser.take().is_some() {
            warn!("chrome session dropped without close; killing browser");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_shrinks_but_never_hits_zero() {
        let limit = Duration::from_secs(1);
        assert!(remaining(Instant::now(), limit) <= limit);

        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap();
        assert_eq!(remaining(long_ago, limit), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn next_call_waits_for_a_timed_out_one() {
        let mut straggler = Straggler::default();
        assert!(straggler.settle(Duration::from_millis(1)).await);

        let slow = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(200)));
        straggler.park(slow);

        assert!(!straggler.settle(Duration::from_millis(1)).await);
        assert!(straggler.settle(Duration::from_secs(5)).await);
        assert!(straggler.settle(Duration::from_millis(1)).await);
    }
}

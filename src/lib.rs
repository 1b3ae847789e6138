//! Browser automation that plans with a language model, executes in Chrome,
//! and diagnoses and replans when a step fails.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod executor;
pub mod planner;
pub mod registry;
pub mod snapshot;
pub mod tracking;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{AgentConfig, PlannerConfig};
pub use controller::Orchestrator;
pub use driver::{BrowserDriver, BrowserSession, ChromeDriver};
pub use error::{DriverError, PlanningError, RegistryError, RunError, StepError};
pub use planner::{OpenAiPlanner, Planner};
pub use registry::{SessionRegistry, StopOutcome};
pub use tracking::{TaskRecord, TaskStatus, TaskStore};
pub use types::{ExecutionEvent, ExecutionResult, Plan, Step, StepOutcome, StepSpec, TaskId};

//! Claudio - terminal console for supervising fleets of AI coding agents
//!
//! Each supervised agent ("instance") runs inside a headless tmux session in
//! its own git worktree. The console scrapes visible output, classifies agent
//! state, routes keystrokes, and coordinates multi-instance workflows
//! (ultra-plan, multi-plan, triple-shot, adversarial).

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod detect;
pub mod driver;
pub mod events;
pub mod instance;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod session;
pub mod ui;
pub mod vcs;
pub mod workflows;

pub use config::Config;
pub use detect::AgentState;
pub use driver::{TerminalDriver, TmuxDriver};
pub use events::{Event, EventBus};
pub use instance::InstanceManager;
pub use orchestrator::Orchestrator;
pub use plan::PlanSpec;
pub use session::{Instance, InstanceGroup, InstanceStatus, Session};

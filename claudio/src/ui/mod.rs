//! Terminal UI - model, input routing, command layer, and the app loop
//!
//! The app loop is the sole mutator of model and session state; everything
//! else (capture workers, artifact polls, git steps) reports back through
//! messages. Rendering is a pure function of the model.

mod app;
mod command;
mod events;
mod input;
mod model;
mod views;

pub use app::{AppLoop, AppMessage, ArtifactOutcome};
pub use command::{CommandResult, UltraPlanRequest, execute};
pub use events::{Event as UiEvent, EventHandler};
pub use model::{
    InstanceOp, InstanceRow, KeyPress, KeySend, KeyTarget, Mode, Model, ModelView, PlanEditorState, WorkflowRequest,
};

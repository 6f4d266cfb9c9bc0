//! Backend adapter: the call contract for the external AI agent backend.
//!
//! One `run_iteration` call is one agent iteration, streamed back as typed
//! events. Cancellation is an explicit token passed into the call, never a
//! control-flow exception.

pub mod adapter;
pub mod scripted;

pub use adapter::{BackendAdapter, BackendEvent, IterationRequest, ModelInfo};
pub use scripted::{ScriptedBackend, ScriptedIteration};

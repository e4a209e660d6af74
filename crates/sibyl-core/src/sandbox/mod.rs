//! The sandbox plane: per-tenant pod-backed execution environments and
//! the durable task queue that carries work into them.

pub mod controller;
pub mod dispatcher;
pub mod runtime;

pub use controller::{SandboxConfig, SandboxController};
pub use dispatcher::{CompletionReport, EnqueueRequest, SandboxDispatcher};
pub use runtime::{MemoryPodRuntime, PodPhase, PodRuntime, PodSpec};

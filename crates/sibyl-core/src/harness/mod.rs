//! Agent harness adapters.
//!
//! A harness wraps one agent CLI and translates its I/O into the common
//! [`types::AgentMessage`] stream. The runner holds a harness through the
//! [`trait_def::AgentHarness`] trait and never sees CLI specifics.

pub mod claude_code;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use claude_code::ClaudeCodeHarness;
pub use registry::HarnessRegistry;
pub use trait_def::AgentHarness;
pub use types::{AgentHandle, AgentMessage, SpawnOptions, TokenUsage};

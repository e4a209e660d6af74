//! Operational SQL store for Sibyl.
//!
//! Holds the relational side of the system: sandbox lifecycle rows, the
//! durable sandbox task queue, the inter-agent message table, the per-agent
//! message log, and backup bookkeeping. Graph-shaped state (tasks, agents,
//! orchestrators) lives in the entity store in `sibyl-core`; this crate is
//! deliberately limited to rows that need transactional SQL semantics.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

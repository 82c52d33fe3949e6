//! Shared utilities for lora-worker integration tests.
//!
//! - `TestHarness`: temp workspace, in-memory job table, local buckets, fake trainer
//! - `WorkerConfigBuilder`: configuration for in-process workers

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{TestHarness, TrainerBehavior};

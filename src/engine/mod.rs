//! Worker dispatch and the compute pipeline.

pub mod compute;
pub mod control;

pub use compute::ComputePipeline;
pub use control::{ControlConfig, Dispatcher};

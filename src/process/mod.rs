pub mod registry;
pub mod runner;

pub use registry::{CancelReport, DEFAULT_GRACE_PERIOD, ProcessHandle, ProcessRegistry};
pub use runner::{ToolOutcome, ToolRunner};

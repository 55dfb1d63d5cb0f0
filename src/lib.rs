pub mod config;
pub mod errors;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod markers;
pub mod orchestrator;
pub mod phase;
pub mod pipeline_config;
pub mod process;
pub mod state;
pub mod ui;
pub mod util;

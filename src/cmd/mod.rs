//! CLI command implementations.
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `run`    | `Run`                                     |
//! | `state`  | `Status`, `Phases`, `Checkpoint`, `Reset` |
//! | `config` | `Config`                                  |

pub mod config;
pub mod run;
pub mod state;

pub use config::cmd_config;
pub use run::run_pipeline;
pub use state::{cmd_checkpoint, cmd_phases, cmd_reset, cmd_status};

//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                    |
//! |------------|-----------------------------------------------------|
//! | `init`     | `Init`                                              |
//! | `run`      | `Run`, `Drive`                                      |
//! | `status`   | `Status`                                            |
//! | `control`  | `Stop`, `Abort`, `Approve`, `Retry`, `Signal`       |
//! | `item`     | `Item`, `Artifact`                                  |
//! | `config`   | `Config`                                            |

pub mod config;
pub mod control;
pub mod init;
pub mod item;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use control::{cmd_item_signal, cmd_signal, cmd_stop};
pub use init::cmd_init;
pub use item::{cmd_artifact, cmd_item};
pub use run::{cmd_drive, cmd_run};
pub use status::cmd_status;

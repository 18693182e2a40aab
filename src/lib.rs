pub mod config;
pub mod errors;
pub mod foreman_config;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod recovery;
pub mod roles;
pub mod signals;
pub mod snapshot;
pub mod tracker;
pub mod util;
pub mod worker;

pub mod adapters;
pub mod config;
pub mod decision;
pub mod error;
pub mod event_log;
pub mod executor;
pub mod graph;
pub mod io;
pub mod monitor;
pub mod paths;
pub mod prober;
pub mod prompt;
pub mod types;
pub mod worker;

pub use config::{Config, IssueDef, Policy};
pub use error::{DroverError, Result};
pub use graph::IssueGraph;
pub use worker::Worker;

pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod persister;
pub mod shutdown;
pub mod tasker;

pub use error::{Result, TaskerError};

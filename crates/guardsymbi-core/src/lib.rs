pub mod config;
pub mod decl;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{GuardError, Result};
pub use event::EventBus;
pub use types::*;

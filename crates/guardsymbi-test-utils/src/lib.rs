//! Mocks and fixtures shared by the GuardSymbi crates' tests.

pub mod assistant;
pub mod fixtures;
pub mod functions;

pub use assistant::MockAssistant;
pub use fixtures::{sample_module, sample_registry, write_temp_toml, SampleInput};
pub use functions::{Recorder, ScriptedFunction, StaticFunction};

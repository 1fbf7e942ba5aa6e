//! Core engine: descriptors, deferred values, registration, planning and execution.

pub mod descriptor;
pub mod error;
pub mod executor;
pub mod options;
pub mod output;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod secrets;
pub mod stack;
pub mod state;
pub mod types;

//! neonform: declarative infrastructure for Neon Postgres.
//!
//! Resources register desired state on a [`core::stack::Stack`]; the
//! [`core::executor::Engine`] orders them by their data-flow dependencies
//! and reconciles each one against the Neon API with create, read, update
//! and delete calls. State is hashed with BLAKE3 and secrets are sealed on disk.

pub mod cli;
pub mod core;
pub mod remote;
pub mod resources;
pub mod tripwire;

//! NF-010: Engine error taxonomy.
//!
//! Validation and cycle errors are raised before any remote call is issued.
//! Remote errors carry the logical name and type token of the resource that
//! produced them so the final report can point at the offender.

use super::output::OutputError;
use crate::remote::RemoteError;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed declaration or option.
    #[error("validation error: {0}")]
    Validation(String),

    /// One or more required inputs were not supplied at registration.
    #[error("resource '{resource}' ({type_token}): missing required field(s): {}", .fields.join(", "))]
    MissingRequiredField {
        resource: String,
        type_token: String,
        fields: Vec<String>,
    },

    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),

    #[error("resource '{resource}' is bound to unknown provider '{provider}'")]
    UnknownProvider { resource: String, provider: String },

    /// The dependency graph is not a DAG.
    #[error("dependency cycle detected involving: {}", .members.join(", "))]
    DependencyCycle { members: Vec<String> },

    /// A remote CRUD call failed fatally (possibly after retries).
    #[error("resource '{resource}' ({type_token}): {source}")]
    Remote {
        resource: String,
        type_token: String,
        #[source]
        source: RemoteError,
    },

    /// A diff requires delete-then-create but the resource is protected.
    #[error("resource '{resource}' ({type_token}) is protected but changes to {} require replacement", .fields.join(", "))]
    ReplacementRequiredButProtected {
        resource: String,
        type_token: String,
        fields: Vec<String>,
    },

    /// A protected resource would have been deleted.
    #[error("resource '{resource}' ({type_token}) is protected and cannot be deleted")]
    ProtectedDelete { resource: String, type_token: String },

    /// A producer this resource depends on did not complete.
    #[error("resource '{resource}' skipped: dependency '{dependency}' did not complete")]
    DependencyFailed { resource: String, dependency: String },

    /// The run was cancelled before this resource started.
    #[error("resource '{resource}' cancelled before it started")]
    Cancelled { resource: String },

    #[error(transparent)]
    Output(#[from] OutputError),

    /// State file I/O, sealing, or serialization problem.
    #[error("state error: {0}")]
    State(String),
}

impl EngineError {
    /// True for errors that are reported before any remote call.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::MissingRequiredField { .. }
                | Self::UnknownResourceType(_)
                | Self::UnknownProvider { .. }
                | Self::DependencyCycle { .. }
        )
    }
}

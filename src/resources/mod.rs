//! Resource types: one descriptor value plus a thin typed facade each.
//!
//! Facades convert typed arguments into registration inputs and expose
//! typed views of the handle's deferred outputs. All validation and
//! reconciliation is generic over the descriptor.

pub mod branch;
pub mod database;
pub mod endpoint;
pub mod project;
pub mod random;
pub mod role;

use crate::core::output::{Input, Output, OutputError};
use crate::core::stack::{Inputs, ResourceHandle};
use serde::Serialize;
use serde_json::Value;

/// Builds registration inputs from typed arguments.
#[derive(Default)]
pub(crate) struct InputsBuilder(Inputs);

impl InputsBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set<T>(mut self, name: &str, value: Input<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.0.insert(name.to_string(), value.into_value());
        self
    }

    /// Absent optional fields are left out entirely.
    pub(crate) fn set_opt<T>(self, name: &str, value: Option<Input<T>>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        match value {
            Some(v) => self.set(name, v),
            None => self,
        }
    }

    pub(crate) fn build(self) -> Inputs {
        self.0
    }
}

/// A handle field the descriptor guarantees; fails the value if it is not there.
pub(crate) fn field(handle: &ResourceHandle, name: &str) -> Output<Value> {
    handle.output(name).unwrap_or_else(|| {
        Output::failed(OutputError::Failed {
            resource: handle.name.clone(),
            reason: format!("{} has no output '{}'", handle.type_token, name),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_nf080_inputs_builder_skips_absent_optionals() {
        let inputs = InputsBuilder::new()
            .set("name", Output::known("main".to_string()))
            .set_opt::<String>("ownerName", None)
            .set_opt("length", Some(Output::known(24u32)))
            .build();
        assert_eq!(inputs.keys().collect::<Vec<_>>(), vec!["name", "length"]);
        assert_eq!(inputs["length"].get().await, Ok(json!(24)));
    }
}

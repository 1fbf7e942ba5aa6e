//! NF-084: Postgres database on a branch.
//!
//! Moving a database to another project or branch replaces it; renaming is
//! an in-place update.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{ResourceHandle, Stack};
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Database",
    short_name: "database",
    inputs: &[
        InputField::required("projectId").immutable(),
        InputField::required("branchId").immutable(),
        InputField::required("name"),
        InputField::optional("ownerName"),
    ],
    outputs: &[OutputField::plain("createdAt")],
    local: false,
};

#[derive(Debug, Clone)]
pub struct DatabaseArgs {
    pub project_id: Input<String>,
    pub branch_id: Input<String>,
    pub name: Input<String>,
    pub owner_name: Option<Input<String>>,
}

#[derive(Debug, Clone)]
pub struct Database {
    pub handle: ResourceHandle,
}

impl Database {
    pub fn new(stack: &mut Stack, name: &str, args: DatabaseArgs, options: ResourceOptions) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("projectId", args.project_id)
            .set("branchId", args.branch_id)
            .set("name", args.name)
            .set_opt("ownerName", args.owner_name)
            .build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

    /// Adopt an existing database. Its id is the database name.
    pub fn get(
        stack: &mut Stack,
        name: &str,
        id: impl Into<Input<String>>,
        project_id: impl Into<Input<String>>,
        branch_id: impl Into<Input<String>>,
        options: ResourceOptions,
    ) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("projectId", project_id.into())
            .set("branchId", branch_id.into())
            .build();
        let handle = stack.lookup(&DESCRIPTOR, name, id.into(), inputs, options)?;
        Ok(Self { handle })
    }

    pub fn id(&self) -> Output<String> {
        self.handle.id.clone()
    }

    pub fn name(&self) -> Output<Value> {
        field(&self.handle, "name")
    }

    pub fn owner_name(&self) -> Output<Value> {
        field(&self.handle, "ownerName")
    }

    pub fn created_at(&self) -> Output<Value> {
        field(&self.handle, "createdAt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::core::output::OutputError;

    #[tokio::test]
    async fn test_nf084_owner_is_optional() {
        let mut stack = Stack::new("demo");
        Database::new(
            &mut stack,
            "db",
            DatabaseArgs {
                project_id: "p-1".into(),
                branch_id: "br-1".into(),
                name: "app".into(),
                owner_name: Some("app_owner".into()),
            },
            ResourceOptions::default(),
        )
        .unwrap();
        let reg = stack.get("db").unwrap();
        assert_eq!(
            reg.inputs.keys().collect::<Vec<_>>(),
            vec!["projectId", "branchId", "name", "ownerName"]
        );
    }

    #[tokio::test]
    async fn test_nf084_failed_upstream_value_is_still_registrable() {
        // A failed input is not "missing"; the engine skips it at deploy time.
        let mut stack = Stack::new("demo");
        let result = Database::new(
            &mut stack,
            "db",
            DatabaseArgs {
                project_id: Output::failed(OutputError::Abandoned),
                branch_id: "br-1".into(),
                name: "app".into(),
                owner_name: None,
            },
            ResourceOptions::default(),
        );
        assert!(result.is_ok());
        assert!(!matches!(result, Err(EngineError::MissingRequiredField { .. })));
    }
}

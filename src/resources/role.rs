//! NF-085: Postgres role. The service generates its password.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{ResourceHandle, Stack};
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Role",
    short_name: "role",
    inputs: &[
        InputField::required("projectId").immutable(),
        InputField::required("branchId").immutable(),
        InputField::required("name").immutable(),
    ],
    outputs: &[OutputField::secret("password"), OutputField::plain("createdAt")],
    local: false,
};

#[derive(Debug, Clone)]
pub struct RoleArgs {
    pub project_id: Input<String>,
    pub branch_id: Input<String>,
    pub name: Input<String>,
}

#[derive(Debug, Clone)]
pub struct Role {
    pub handle: ResourceHandle,
}

impl Role {
    pub fn new(stack: &mut Stack, name: &str, args: RoleArgs, options: ResourceOptions) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("projectId", args.project_id)
            .set("branchId", args.branch_id)
            .set("name", args.name)
            .build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

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

    /// Always secret.
    pub fn password(&self) -> Output<Value> {
        field(&self.handle, "password")
    }

    pub fn created_at(&self) -> Output<Value> {
        field(&self.handle, "createdAt")
    }
}

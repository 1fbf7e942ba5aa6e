//! NF-082: Neon branch, a copy-on-write Postgres timeline inside a project.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{ResourceHandle, Stack};
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Branch",
    short_name: "branch",
    inputs: &[
        InputField::required("projectId").immutable(),
        InputField::required("name"),
    ],
    outputs: &[OutputField::plain("createdAt")],
    local: false,
};

#[derive(Debug, Clone)]
pub struct BranchArgs {
    pub project_id: Input<String>,
    pub name: Input<String>,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub handle: ResourceHandle,
}

impl Branch {
    pub fn new(stack: &mut Stack, name: &str, args: BranchArgs, options: ResourceOptions) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("projectId", args.project_id)
            .set("name", args.name)
            .build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

    /// Adopt an existing branch of `project_id` by id.
    pub fn get(
        stack: &mut Stack,
        name: &str,
        id: impl Into<Input<String>>,
        project_id: impl Into<Input<String>>,
        options: ResourceOptions,
    ) -> EngineResult<Self> {
        let inputs = InputsBuilder::new().set("projectId", project_id.into()).build();
        let handle = stack.lookup(&DESCRIPTOR, name, id.into(), inputs, options)?;
        Ok(Self { handle })
    }

    pub fn id(&self) -> Output<String> {
        self.handle.id.clone()
    }

    pub fn project_id(&self) -> Output<Value> {
        field(&self.handle, "projectId")
    }

    pub fn name(&self) -> Output<Value> {
        field(&self.handle, "name")
    }

    pub fn created_at(&self) -> Output<Value> {
        field(&self.handle, "createdAt")
    }
}

//! NF-081: Neon project, the top-level container of branches.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{Inputs, ResourceHandle, Stack};
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Project",
    short_name: "project",
    inputs: &[
        InputField::required("name"),
        InputField::required("regionId").immutable(),
    ],
    outputs: &[OutputField::plain("createdAt")],
    local: false,
};

#[derive(Debug, Clone)]
pub struct ProjectArgs {
    pub name: Input<String>,
    /// Cloud region, e.g. `aws-us-east-2`. Changing it replaces the project.
    pub region_id: Input<String>,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub handle: ResourceHandle,
}

impl Project {
    pub fn new(stack: &mut Stack, name: &str, args: ProjectArgs, options: ResourceOptions) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("name", args.name)
            .set("regionId", args.region_id)
            .build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

    /// Adopt an existing project by id.
    pub fn get(
        stack: &mut Stack,
        name: &str,
        id: impl Into<Input<String>>,
        options: ResourceOptions,
    ) -> EngineResult<Self> {
        let handle = stack.lookup(&DESCRIPTOR, name, id.into(), Inputs::new(), options)?;
        Ok(Self { handle })
    }

    pub fn id(&self) -> Output<String> {
        self.handle.id.clone()
    }

    pub fn name(&self) -> Output<Value> {
        field(&self.handle, "name")
    }

    pub fn region_id(&self) -> Output<Value> {
        field(&self.handle, "regionId")
    }

    pub fn created_at(&self) -> Output<Value> {
        field(&self.handle, "createdAt")
    }
}

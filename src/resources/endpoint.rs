//! NF-083: Compute endpoint serving a branch.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{ResourceHandle, Stack};
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Endpoint",
    short_name: "endpoint",
    inputs: &[
        InputField::required("projectId").immutable(),
        InputField::required("branchId"),
        InputField::optional("type"),
    ],
    outputs: &[OutputField::plain("host"), OutputField::plain("createdAt")],
    local: false,
};

#[derive(Debug, Clone)]
pub struct EndpointArgs {
    pub project_id: Input<String>,
    pub branch_id: Input<String>,
    /// `read_write` or `read_only`; the service defaults to `read_write`.
    pub endpoint_type: Option<Input<String>>,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub handle: ResourceHandle,
}

impl Endpoint {
    pub fn new(stack: &mut Stack, name: &str, args: EndpointArgs, options: ResourceOptions) -> EngineResult<Self> {
        let inputs = InputsBuilder::new()
            .set("projectId", args.project_id)
            .set("branchId", args.branch_id)
            .set_opt("type", args.endpoint_type)
            .build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

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

    pub fn branch_id(&self) -> Output<Value> {
        field(&self.handle, "branchId")
    }

    /// Hostname clients connect to.
    pub fn host(&self) -> Output<Value> {
        field(&self.handle, "host")
    }

    pub fn created_at(&self) -> Output<Value> {
        field(&self.handle, "createdAt")
    }
}

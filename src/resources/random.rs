//! NF-086: Random string, a local resource with no remote counterpart.
//!
//! The value is generated once on create and persisted (sealed) in state;
//! later runs reuse it unless `length` changes, which replaces it.

use super::{field, InputsBuilder};
use crate::core::descriptor::{InputField, OutputField, ResourceDescriptor};
use crate::core::error::EngineResult;
use crate::core::options::ResourceOptions;
use crate::core::output::{Input, Output};
use crate::core::stack::{ResourceHandle, Stack};
use crate::core::types::Fields;
use crate::remote::{CrudApi, RemoteError, RemoteObject};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

pub const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
    type_token: "neon:index:Random",
    short_name: "random",
    inputs: &[InputField::required("length").immutable()],
    outputs: &[OutputField::secret("result")],
    local: true,
};

pub const MAX_LENGTH: u64 = 1024;

#[derive(Debug, Clone)]
pub struct RandomArgs {
    pub length: Input<u32>,
}

#[derive(Debug, Clone)]
pub struct Random {
    pub handle: ResourceHandle,
}

impl Random {
    pub fn new(
        stack: &mut Stack,
        name: &str,
        args: RandomArgs,
        options: ResourceOptions,
    ) -> EngineResult<Self> {
        let inputs = InputsBuilder::new().set("length", args.length).build();
        let handle = stack.register(&DESCRIPTOR, name, inputs, options)?;
        Ok(Self { handle })
    }

    pub fn id(&self) -> Output<String> {
        self.handle.id.clone()
    }

    /// The generated password; always secret.
    pub fn result(&self) -> Output<Value> {
        field(&self.handle, "result")
    }
}

/// Alphanumeric string of `length` characters.
pub fn generate(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn requested_length(inputs: &Fields) -> Result<usize, RemoteError> {
    let length = inputs
        .get("length")
        .and_then(Value::as_u64)
        .ok_or_else(|| RemoteError::fatal("length must be a positive integer"))?;
    if length == 0 || length > MAX_LENGTH {
        return Err(RemoteError::fatal(format!(
            "length must be between 1 and {}, got {}",
            MAX_LENGTH, length
        )));
    }
    Ok(length as usize)
}

/// In-process provider for [`DESCRIPTOR`].
///
/// Reads and updates echo the inputs back without `result`; the engine keeps
/// the value recorded in state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomApi;

#[async_trait]
impl CrudApi for RandomApi {
    async fn create(
        &self,
        _type_token: &str,
        idempotency_key: &str,
        inputs: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        let length = requested_length(inputs)?;
        let result = generate(length);
        let id = format!(
            "random-{}",
            idempotency_key.get(..16).unwrap_or(idempotency_key)
        );
        let mut fields = inputs.clone();
        fields.insert("result".to_string(), Value::String(result));
        Ok(RemoteObject { id, fields })
    }

    async fn read(&self, _type_token: &str, id: &str, inputs: &Fields) -> Result<RemoteObject, RemoteError> {
        Ok(RemoteObject {
            id: id.to_string(),
            fields: inputs.clone(),
        })
    }

    async fn update(
        &self,
        _type_token: &str,
        id: &str,
        _olds: &Fields,
        news: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        requested_length(news)?;
        Ok(RemoteObject {
            id: id.to_string(),
            fields: news.clone(),
        })
    }

    async fn delete(&self, _type_token: &str, _id: &str, _inputs: &Fields) -> Result<(), RemoteError> {
        Ok(())
    }
}

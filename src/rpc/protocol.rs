//! Request routing for the RPC server
//!
//! A request names a method and carries positional parameters, mirroring the
//! call shape `method(options, manifest)`:
//!
//! ```text
//! {"id": 1, "method": "up", "params": [{"project_name": "shop"}, "services: ..."]}
//! {"id": 1, "result": {"web": {"plan": {...}, "hash": "...", ...}}}
//! {"id": 2, "error": {"name": "ConnectionError", "message": "..."}}
//! ```

use crate::controller::OrchestrationController;
use crate::error::{KeelError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
}

impl From<&KeelError> for ErrorBody {
    fn from(e: &KeelError) -> Self {
        Self {
            name: e.name().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Result(Value),
    #[serde(rename = "error")]
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn error(id: Value, e: &KeelError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(e.into()),
        }
    }
}

/// Routes requests to the controller
#[derive(Clone)]
pub struct RpcHandler {
    controller: Arc<OrchestrationController>,
}

impl RpcHandler {
    pub fn new(controller: Arc<OrchestrationController>) -> Self {
        Self { controller }
    }

    /// Handle one raw request line
    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::error(Value::Null, &KeelError::InvalidParams(e.to_string())),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("RPC request: {} id={}", request.method, request.id);

        match self.call(&request.method, &request.params).await {
            Ok(result) => Response {
                id: request.id,
                outcome: Outcome::Result(result),
            },
            Err(e) => {
                warn!("RPC {} failed: {}", request.method, e);
                Response::error(request.id, &e)
            }
        }
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        match method {
            "ping" => Ok(json!(self.controller.ping())),
            "config" => {
                let (options, manifest) = arguments(params)?;
                let view = self.controller.config(options, &manifest).await?;
                Ok(serde_json::to_value(view)?)
            }
            "up" => {
                let (options, manifest) = arguments(params)?;
                let tree = self.controller.up(options, &manifest).await?;
                Ok(serde_json::to_value(tree)?)
            }
            "scale" => {
                let (options, manifest) = arguments(params)?;
                self.controller.scale(options, &manifest).await?;
                Ok(Value::Null)
            }
            other => Err(KeelError::UnknownMethod(other.to_string())),
        }
    }
}

/// Split positional parameters into an option record and the manifest
fn arguments<T: DeserializeOwned>(params: &[Value]) -> Result<(T, String)> {
    let options = match params.first() {
        None | Some(Value::Null) => json!({}),
        Some(value) => value.clone(),
    };
    let options = serde_json::from_value(options)
        .map_err(|e| KeelError::InvalidParams(format!("options: {}", e)))?;

    let manifest = match params.get(1) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(KeelError::InvalidParams(format!(
                "manifest must be a string, got {}",
                other
            )))
        }
    };

    Ok((options, manifest))
}

use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::ConfigError;
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::store::{SqliteStore, StoreError};
use crate::workflow::{WorkflowEngine, WorkflowError};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<WorkflowError> for HandlerErr {
    fn from(e: WorkflowError) -> Self {
        let details = match &e {
            WorkflowError::InvalidTransition { from, action } => {
                Some(json!({ "status": from, "action": action }))
            }
            WorkflowError::MarksLocked(status) => Some(json!({ "status": status })),
            _ => None,
        };
        Self {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        HandlerErr::from(WorkflowError::from(e))
    }
}

impl From<ConfigError> for HandlerErr {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Store(s) => s.into(),
            other => HandlerErr::new("invalid_config", other.to_string()),
        }
    }
}

pub fn engine(state: &AppState) -> Result<&WorkflowEngine, HandlerErr> {
    state
        .engine
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn store(state: &AppState) -> Result<&SqliteStore, HandlerErr> {
    state
        .store
        .as_deref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Deserializes one field of `params` into `T`.
pub fn get_typed<T: DeserializeOwned>(params: &serde_json::Value, key: &str) -> Result<T, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Err(HandlerErr::new("bad_params", format!("missing {}", key)));
    };
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("invalid {}: {}", key, e)))
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => crate::ipc::error::ok(id, v),
        Err(e) => e.response(id),
    }
}

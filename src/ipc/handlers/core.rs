use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let store = match SqliteStore::open(&path) {
        Ok(s) => Arc::new(s),
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    // Broken settings rows must not keep the workspace from opening.
    let config = match store.load_config() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "workspace settings invalid, using defaults");
            Default::default()
        }
    };

    state.attach(store, config);
    state.workspace = Some(path.clone());
    info!(workspace = %path.display(), "workspace selected");
    ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}

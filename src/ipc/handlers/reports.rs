use crate::ipc::helpers::{engine, get_required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn cgpa_calculate(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let summary = engine.calculate_cgpa(&student_id)?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("serialize_failed", e.to_string()))
}

fn workflows_snapshots(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let snapshots = engine.snapshots(&workflow_id)?;
    Ok(json!({ "snapshots": snapshots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "cgpa.calculate" => cgpa_calculate(state, &req.params),
        "workflows.snapshots" => workflows_snapshots(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

use crate::config::{OtpPolicy, ServiceConfig};
use crate::grading::{CourseWeights, GradingScale};
use crate::ipc::helpers::{get_required_str, get_typed, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{Course, EnrollmentStatus, Role};
use crate::workflow::WorkflowKey;
use serde_json::json;
use std::sync::Arc;

fn courses_upsert(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let course: Course = serde_json::from_value(params.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("invalid course: {}", e)))?;
    if course.id.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "id must not be empty"));
    }
    if !course.credit.is_finite() || course.credit < 0.0 {
        return Err(HandlerErr::new("bad_params", "credit must be a non-negative number"));
    }
    store.upsert_course(&course)?;
    Ok(json!({ "courseId": course.id }))
}

fn parse_role(params: &serde_json::Value) -> Result<Role, HandlerErr> {
    let raw = get_required_str(params, "role")?;
    Role::parse(&raw).ok_or_else(|| HandlerErr::new("bad_params", "role must be instructor or committee"))
}

fn roles_grant(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let actor_id = get_required_str(params, "actorId")?;
    let course_id = get_required_str(params, "courseId")?;
    let role = parse_role(params)?;
    store.grant_role(&actor_id, &course_id, role)?;
    Ok(json!({ "ok": true }))
}

fn roles_revoke(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let actor_id = get_required_str(params, "actorId")?;
    let course_id = get_required_str(params, "courseId")?;
    let role = parse_role(params)?;
    let removed = store.revoke_role(&actor_id, &course_id, role)?;
    Ok(json!({ "removed": removed }))
}

fn enrollments_set(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let key: WorkflowKey = serde_json::from_value(params.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("invalid key: {}", e)))?;
    let student_id = get_required_str(params, "studentId")?;
    let status = match params.get("status").and_then(|v| v.as_str()) {
        None => EnrollmentStatus::Active,
        Some(raw) => EnrollmentStatus::parse(raw).ok_or_else(|| {
            HandlerErr::new("bad_params", "status must be active, dropped or completed")
        })?,
    };
    store.set_enrollment(&key, &student_id, status)?;
    Ok(json!({ "studentId": student_id, "status": status }))
}

fn settings_grading_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    store(state)?;
    serde_json::to_value(&state.config)
        .map_err(|e| HandlerErr::new("serialize_failed", e.to_string()))
}

/// Replaces whichever sections are present, then rebuilds the engine so new
/// requests see the new settings.
fn settings_grading_set(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = state
        .store
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let mut cfg: ServiceConfig = state.config.clone();
    if params.get("scale").is_some() {
        cfg.scale = get_typed::<GradingScale>(params, "scale")?;
    }
    if params.get("weights").is_some() {
        cfg.weights = get_typed::<CourseWeights>(params, "weights")?;
    }
    if params.get("otp").is_some() {
        cfg.otp = get_typed::<OtpPolicy>(params, "otp")?;
    }
    store.save_config(&cfg)?;
    state.attach(Arc::clone(&store), cfg);
    settings_grading_get(state)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.upsert" => courses_upsert(state, &req.params),
        "roles.grant" => roles_grant(state, &req.params),
        "roles.revoke" => roles_revoke(state, &req.params),
        "enrollments.set" => enrollments_set(state, &req.params),
        "settings.grading.get" => settings_grading_get(state),
        "settings.grading.set" => settings_grading_set(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

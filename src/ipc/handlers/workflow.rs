use crate::grading::ComponentMarks;
use crate::ipc::helpers::{engine, get_optional_str, get_required_str, get_typed, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{Action, WorkflowKey};
use serde_json::json;

fn parse_action(raw: &str) -> Result<Action, HandlerErr> {
    match raw {
        "approve" => Ok(Action::Approve),
        "return" => Ok(Action::Return),
        "publish" => Ok(Action::Publish),
        _ => Err(HandlerErr::new(
            "bad_params",
            "action must be approve, return or publish",
        )),
    }
}

fn workflows_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let key: WorkflowKey = serde_json::from_value(params.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("invalid key: {}", e)))?;
    let actor_id = get_required_str(params, "actorId")?;
    let workflow = engine.create_workflow(&key, &actor_id)?;
    Ok(json!({ "workflow": workflow }))
}

fn workflows_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let workflow = engine.workflow(&workflow_id)?;
    let active = engine.active_enrollment_count(&workflow)?;
    Ok(json!({
        "workflow": workflow,
        "activeEnrollmentCount": active,
    }))
}

fn workflows_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let workflows = store.list_workflows(get_optional_str(params, "courseId"))?;
    Ok(json!({ "workflows": workflows }))
}

fn workflows_grades(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let grades = engine.grades(&workflow_id)?;
    Ok(json!({ "grades": grades }))
}

fn marks_enter(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let student_id = get_required_str(params, "studentId")?;
    let marks: ComponentMarks = get_typed(params, "marks")?;
    let record = engine.enter_marks(&workflow_id, &actor_id, &student_id, marks)?;
    Ok(json!({ "grade": record }))
}

fn otp_issue(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let action = parse_action(&get_required_str(params, "action")?)?;
    let issued = engine.issue_otp(&workflow_id, &actor_id, action)?;
    let mut out = json!({
        "challengeId": issued.challenge_id,
        "purpose": issued.purpose,
        "expiresAt": issued.expires_at,
    });
    if engine.gate().policy().expose_codes {
        out["code"] = json!(issued.code);
    }
    Ok(out)
}

fn transition(state: &AppState, params: &serde_json::Value, action: Action) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let otp = get_optional_str(params, "otp");
    let status = match action {
        Action::Submit => engine.submit(&workflow_id, &actor_id)?,
        Action::Approve => engine.approve(&workflow_id, &actor_id, otp)?,
        Action::Return => {
            let comment = get_optional_str(params, "comment").unwrap_or("");
            engine.return_to_instructor(&workflow_id, &actor_id, otp, comment)?
        }
        Action::Publish => engine.publish(&workflow_id, &actor_id, otp)?,
    };
    Ok(json!({ "workflowId": workflow_id, "status": status }))
}

fn audit_history(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let engine = engine(state)?;
    let workflow_id = get_required_str(params, "workflowId")?;
    let entries = engine.history(&workflow_id)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let params = &req.params;
    let result = match req.method.as_str() {
        "workflows.create" => workflows_create(state, params),
        "workflows.get" => workflows_get(state, params),
        "workflows.list" => workflows_list(state, params),
        "workflows.grades" => workflows_grades(state, params),
        "marks.enter" => marks_enter(state, params),
        "otp.issue" => otp_issue(state, params),
        "workflow.submit" => transition(state, params, Action::Submit),
        "workflow.approve" => transition(state, params, Action::Approve),
        "workflow.return" => transition(state, params, Action::Return),
        "workflow.publish" => transition(state, params, Action::Publish),
        "audit.history" => audit_history(state, params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

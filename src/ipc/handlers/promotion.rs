use serde_json::json;

use super::{ids_param, NO_WORKSPACE};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{ClassLevel, StudentStatus, MAX_LEVEL};
use crate::promotion::BatchOutcome;

fn outcome_json(outcome: &BatchOutcome) -> serde_json::Value {
    let failed: Vec<serde_json::Value> = outcome
        .failed
        .iter()
        .map(|(id, message)| json!({ "studentId": id, "message": message }))
        .collect();
    json!({
        "succeeded": outcome.succeeded(),
        "contexts": outcome.contexts_in_input_order(),
        "failed": failed,
        "updates": outcome.updates,
    })
}

// Accepts either a number or a class label such as "Kelas 4".
fn level_param(req: &Request) -> Option<u32> {
    let v = req.params.get("level")?;
    let level = match v.as_u64() {
        Some(n) => u32::try_from(n).ok()?,
        None => ClassLevel::parse(v.as_str()?).level()?,
    };
    (1..=MAX_LEVEL).contains(&level).then_some(level)
}

async fn handle_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let Some(ids) = ids_param(req, "studentIds") else {
        return err(&req.id, "bad_params", "missing studentIds", None);
    };
    let Some(level) = level_param(req) else {
        return err(&req.id, "bad_params", "missing or invalid level", None);
    };
    let year = req.params.get("year").and_then(|v| v.as_str()).unwrap_or("");
    let term = req.params.get("term").and_then(|v| v.as_str()).unwrap_or("");
    if year.trim().is_empty() || term.trim().is_empty() {
        return err(&req.id, "bad_params", "year and term are required", None);
    }

    match session.promote(&ids, level, year, term).await {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

async fn handle_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let Some(ids) = ids_param(req, "studentIds") else {
        return err(&req.id, "bad_params", "missing studentIds", None);
    };
    let status = match req
        .params
        .get("status")
        .cloned()
        .map(serde_json::from_value::<StudentStatus>)
    {
        Some(Ok(s)) if s != StudentStatus::Promoted => s,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "status must be active, graduated or withdrawn",
                None,
            )
        }
    };

    match session.set_status(&ids, status).await {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome)),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.promote" => Some(handle_promote(state, req).await),
        "promotion.setStatus" => Some(handle_set_status(state, req).await),
        _ => None,
    }
}

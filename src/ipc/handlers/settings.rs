use serde_json::json;

use super::NO_WORKSPACE;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    ok(&req.id, json!({ "settings": session.settings() }))
}

async fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing params.patch object", None);
    };
    let next = match session.settings().patched(patch) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    if let Err(e) = session.apply_settings(next).await {
        return err(&req.id, "db_query_failed", format!("{e:#}"), None);
    }
    if let Err(e) = session.store().save_settings(session.settings()) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "settings" })),
        );
    }
    ok(&req.id, json!({ "settings": session.settings() }))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req).await),
        _ => None,
    }
}

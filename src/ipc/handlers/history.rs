use serde_json::json;

use super::NO_WORKSPACE;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

fn handle_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let h = session.history();
    ok(
        &req.id,
        json!({
            "canUndo": h.can_undo(),
            "canRedo": h.can_redo(),
            "undoLabel": h.peek_undo().map(|c| c.label()),
            "redoLabel": h.peek_redo().map(|c| c.label()),
            "undoDepth": h.undo_len(),
            "redoDepth": h.redo_len(),
        }),
    )
}

async fn handle_step(state: &mut AppState, req: &Request, redo: bool) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let result = if redo {
        session.redo().await
    } else {
        session.undo().await
    };
    match result {
        Ok(Some(updates)) => ok(&req.id, json!({ "performed": true, "updates": updates })),
        Ok(None) => ok(&req.id, json!({ "performed": false, "updates": [] })),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "history.undo" => Some(handle_step(state, req, false).await),
        "history.redo" => Some(handle_step(state, req, true).await),
        "history.state" => Some(handle_state(state, req)),
        _ => None,
    }
}

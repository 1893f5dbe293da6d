use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::config::RosterSettings;
use crate::events::EventBus;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::RosterSession;
use crate::store::SqliteStore;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

async fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let store = match SqliteStore::open(&path) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    // A corrupt settings row must not keep the workspace closed.
    let settings = store.load_settings().unwrap_or_else(|e| {
        warn!(error = %e, "roster settings unreadable, using defaults");
        RosterSettings::default()
    });

    let events = EventBus::new();
    let rx = events.subscribe();
    let mut session = RosterSession::new(Arc::new(store), settings, events);
    let count = match session.reload().await {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };

    info!(workspace = %path.display(), students = count, "workspace opened");
    state.workspace = Some(path.clone());
    state.session = Some(session);
    state.events = Some(rx);
    ok(
        &req.id,
        json!({ "workspacePath": path.to_string_lossy(), "studentCount": count }),
    )
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req).await),
        _ => None,
    }
}

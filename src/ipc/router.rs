use super::handlers;
use super::types::{AppState, Request};
use crate::events;
use crate::ipc::error::err;

pub async fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let mut resp = dispatch(state, &req).await;
    attach_events(state, &mut resp);
    resp
}

async fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req).await {
        return resp;
    }
    if let Some(resp) = handlers::settings::try_handle(state, req).await {
        return resp;
    }
    if let Some(resp) = handlers::roster::try_handle(state, req).await {
        return resp;
    }
    if let Some(resp) = handlers::promotion::try_handle(state, req).await {
        return resp;
    }
    if let Some(resp) = handlers::history::try_handle(state, req).await {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

// Events published while handling a request ride along in its result.
fn attach_events(state: &mut AppState, resp: &mut serde_json::Value) {
    let Some(rx) = state.events.as_mut() else {
        return;
    };
    let drained = events::drain(rx);
    if drained.is_empty() {
        return;
    }
    let Some(result) = resp.get_mut("result").and_then(|r| r.as_object_mut()) else {
        return;
    };
    if let Ok(v) = serde_json::to_value(&drained) {
        result.insert("events".into(), v);
    }
}

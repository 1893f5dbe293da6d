use serde_json::json;

use super::{id_param, persist_settings, NO_WORKSPACE};
use crate::config::ViewMode;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{NewStudent, SortDescriptor, StudentColumn};
use crate::roster::{GroupedIndex, RosterIndex, RosterSource, RowInfo};

fn rows_json(index: &RosterIndex) -> serde_json::Value {
    match index {
        RosterIndex::Flat(flat) => {
            let rows: Vec<serde_json::Value> = flat
                .as_slice()
                .iter()
                .enumerate()
                .map(|(row, s)| json!({ "kind": "student", "row": row, "student": s }))
                .collect();
            json!({ "mode": "plain", "rowCount": rows.len(), "rows": rows })
        }
        RosterIndex::Grouped(grouped) => {
            let sizes = grouped.bucket_sizes();
            let rows: Vec<serde_json::Value> = grouped
                .rows()
                .into_iter()
                .enumerate()
                .map(|(row, (info, student))| match (info, student) {
                    (RowInfo::Student { section, offset }, Some(s)) => json!({
                        "kind": "student",
                        "row": row,
                        "section": section,
                        "offset": offset,
                        "student": s
                    }),
                    (info, _) => json!({
                        "kind": "header",
                        "row": row,
                        "section": info.section(),
                        "label": GroupedIndex::header_label(info.section()),
                        "count": sizes.get(info.section()).copied().unwrap_or(0)
                    }),
                })
                .collect();
            json!({ "mode": "grouped", "rowCount": rows.len(), "rows": rows })
        }
    }
}

async fn handle_fetch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    match session.reload().await {
        Ok(n) => ok(
            &req.id,
            json!({ "studentCount": n, "rowCount": session.index().row_count() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

async fn handle_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let query = req
        .params
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match session.search(query).await {
        Ok(n) => ok(&req.id, json!({ "studentCount": n })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    ok(&req.id, rows_json(session.index()))
}

fn handle_set_mode(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let mode = match req
        .params
        .get("mode")
        .cloned()
        .map(serde_json::from_value::<ViewMode>)
    {
        Some(Ok(m)) => m,
        _ => return err(&req.id, "bad_params", "mode must be plain or grouped", None),
    };
    let changed = session.set_mode(mode);
    if changed {
        persist_settings(session);
    }
    ok(
        &req.id,
        json!({ "changed": changed, "rowCount": session.index().row_count() }),
    )
}

fn handle_sort(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let sort = match serde_json::from_value::<SortDescriptor>(req.params.clone()) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    session.set_sort(sort);
    persist_settings(session);
    ok(&req.id, json!({ "sort": sort }))
}

async fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let draft = match req
        .params
        .get("student")
        .cloned()
        .map(serde_json::from_value::<NewStudent>)
    {
        Some(Ok(d)) => d,
        Some(Err(e)) => return err(&req.id, "bad_params", e.to_string(), None),
        None => return err(&req.id, "bad_params", "missing student", None),
    };
    if draft.name.trim().is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    match session.create_student(draft).await {
        Ok((student, update)) => ok(&req.id, json!({ "student": student, "update": update })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            format!("{e:#}"),
            Some(json!({ "table": "students" })),
        ),
    }
}

async fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let Some(id) = id_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    match session.delete_student(id).await {
        Ok(update) => ok(&req.id, json!({ "update": update })),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

async fn handle_edit_field(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let Some(id) = id_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let column = match req
        .params
        .get("column")
        .cloned()
        .map(serde_json::from_value::<StudentColumn>)
    {
        Some(Ok(c)) => c,
        _ => return err(&req.id, "bad_params", "missing or unknown column", None),
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    let column_index = req
        .params
        .get("columnIndex")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize);

    match session.edit_field(id, column, value, column_index).await {
        Ok(update) => ok(&req.id, json!({ "update": update })),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

async fn handle_filter(state: &mut AppState, req: &Request, withdrawn: bool) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_workspace", NO_WORKSPACE, None);
    };
    let key = if withdrawn { "hide" } else { "show" };
    let Some(flag) = req.params.get(key).and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", format!("missing {key}"), None);
    };
    let result = if withdrawn {
        session.set_hide_withdrawn(flag).await
    } else {
        session.set_show_graduated(flag).await
    };
    match result {
        Ok(updates) => {
            persist_settings(session);
            ok(&req.id, json!({ "updates": updates }))
        }
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.fetch" => Some(handle_fetch(state, req).await),
        "roster.search" => Some(handle_search(state, req).await),
        "roster.rows" => Some(handle_rows(state, req)),
        "roster.setMode" => Some(handle_set_mode(state, req)),
        "roster.sort" => Some(handle_sort(state, req)),
        "roster.create" => Some(handle_create(state, req).await),
        "roster.delete" => Some(handle_delete(state, req).await),
        "roster.editField" => Some(handle_edit_field(state, req).await),
        "roster.filterWithdrawn" => Some(handle_filter(state, req, true).await),
        "roster.filterGraduated" => Some(handle_filter(state, req, false).await),
        _ => None,
    }
}

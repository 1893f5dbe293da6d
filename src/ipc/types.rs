use std::path::PathBuf;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::events::RosterEvent;
use crate::session::RosterSession;
use crate::store::SqliteStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub session: Option<RosterSession<SqliteStore>>,
    pub events: Option<broadcast::Receiver<RosterEvent>>,
}

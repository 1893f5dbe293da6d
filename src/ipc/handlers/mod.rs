pub mod core;
pub mod history;
pub mod promotion;
pub mod roster;
pub mod settings;

use crate::model::StudentId;
use crate::store::SqliteStore;
use tracing::warn;

use super::types::Request;

pub(crate) const NO_WORKSPACE: &str = "select a workspace first";

pub(crate) fn id_param(req: &Request, key: &str) -> Option<StudentId> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub(crate) fn ids_param(req: &Request, key: &str) -> Option<Vec<StudentId>> {
    req.params
        .get(key)?
        .as_array()?
        .iter()
        .map(|v| v.as_i64())
        .collect()
}

pub(crate) fn persist_settings(session: &crate::session::RosterSession<SqliteStore>) {
    if let Err(e) = session.store().save_settings(session.settings()) {
        warn!(error = %e, "could not persist roster settings");
    }
}

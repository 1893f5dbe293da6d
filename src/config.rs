use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::db;
use crate::model::{SortDescriptor, Student, StudentStatus};
use crate::store::StudentFilter;

pub const SETTINGS_KEY: &str = "roster.settings";
pub const LOG_ENV: &str = "ROSTERD_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";
const DEFAULT_UNDO_LEVELS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewMode {
    #[default]
    Plain,
    Grouped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RosterSettings {
    pub mode: ViewMode,
    pub hide_withdrawn: bool,
    pub show_graduated: bool,
    pub sort: SortDescriptor,
    pub undo_levels: usize,
}

impl Default for RosterSettings {
    fn default() -> Self {
        Self {
            mode: ViewMode::Plain,
            hide_withdrawn: false,
            show_graduated: true,
            sort: SortDescriptor::default(),
            undo_levels: DEFAULT_UNDO_LEVELS,
        }
    }
}

impl RosterSettings {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let Some(v) = db::settings_get_json(conn, SETTINGS_KEY)? else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_value(v)?)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(self)?)
    }

    /// Applies a partial JSON object on top of the current values.
    pub fn patched(&self, patch: &serde_json::Value) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(self)?;
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), patch.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn filter(&self) -> StudentFilter {
        StudentFilter {
            hide_withdrawn: self.hide_withdrawn,
            show_graduated: self.show_graduated,
            search: None,
        }
    }

    pub fn is_visible(&self, student: &Student) -> bool {
        match student.status {
            StudentStatus::Withdrawn => !self.hide_withdrawn,
            StudentStatus::Graduated => self.show_graduated,
            _ => true,
        }
    }
}

pub fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StudentColumn;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let s: RosterSettings = serde_json::from_str(r#"{"mode":"grouped"}"#).unwrap();
        assert_eq!(s.mode, ViewMode::Grouped);
        assert!(s.show_graduated);
        assert_eq!(s.undo_levels, 100);
    }

    #[test]
    fn patch_overrides_only_given_keys() {
        let base = RosterSettings::default();
        let next = base
            .patched(&serde_json::json!({
                "hideWithdrawn": true,
                "sort": { "column": "address", "ascending": false }
            }))
            .unwrap();
        assert!(next.hide_withdrawn);
        assert_eq!(next.sort.column, StudentColumn::Address);
        assert_eq!(next.mode, base.mode);
    }

    #[test]
    fn visibility_follows_filters() {
        let s = RosterSettings {
            hide_withdrawn: true,
            show_graduated: false,
            ..RosterSettings::default()
        };
        let mut st = Student::new(1, "Ani");
        assert!(s.is_visible(&st));
        st.status = StudentStatus::Withdrawn;
        assert!(!s.is_visible(&st));
        st.status = StudentStatus::Graduated;
        assert!(!s.is_visible(&st));
    }

    #[test]
    fn settings_persist_in_settings_table() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        assert_eq!(RosterSettings::load(&conn).unwrap(), RosterSettings::default());

        let s = RosterSettings {
            mode: ViewMode::Grouped,
            undo_levels: 5,
            ..RosterSettings::default()
        };
        s.save(&conn).unwrap();
        assert_eq!(RosterSettings::load(&conn).unwrap(), s);
    }
}

use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, warn};

use crate::config::{RosterSettings, ViewMode};
use crate::events::EventBus;
use crate::model::{FieldEdit, NewStudent, SortDescriptor, Student, StudentColumn, StudentId};
use crate::promotion::{Transition, TransitionBatch};
use crate::roster::{FlatIndex, GroupedIndex, RosterIndex, RosterSource, UpdateData};
use crate::store::RosterStore;
use crate::undo::UndoStack;

/// Inverse operations kept on the session's undo stack.
#[derive(Debug, Clone)]
pub enum RosterCommand {
    RevertField(FieldEdit),
    ReapplyField(FieldEdit),
    UndoTransition(TransitionBatch),
    RedoTransition {
        transition: Transition,
        ids: Vec<StudentId>,
    },
}

impl RosterCommand {
    pub fn label(&self) -> &'static str {
        match self {
            RosterCommand::RevertField(_) | RosterCommand::ReapplyField(_) => "edit",
            RosterCommand::UndoTransition(b) => b.transition.label(),
            RosterCommand::RedoTransition { transition, .. } => transition.label(),
        }
    }
}

/// One open roster: the in-memory index plus everything it collaborates with.
pub struct RosterSession<S: RosterStore + ?Sized> {
    pub(crate) index: RosterIndex,
    pub(crate) store: Arc<S>,
    pub(crate) events: EventBus,
    pub(crate) undo: UndoStack<RosterCommand>,
    pub(crate) settings: RosterSettings,
}

impl<S: RosterStore + ?Sized> RosterSession<S> {
    pub fn new(store: Arc<S>, settings: RosterSettings, events: EventBus) -> Self {
        let index = match settings.mode {
            ViewMode::Plain => RosterIndex::Flat(FlatIndex::default()),
            ViewMode::Grouped => RosterIndex::Grouped(GroupedIndex::default()),
        };
        Self {
            index,
            store,
            events,
            undo: UndoStack::with_limit(settings.undo_levels),
            settings,
        }
    }

    pub fn index(&self) -> &RosterIndex {
        &self.index
    }

    pub fn settings(&self) -> &RosterSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn history(&self) -> &UndoStack<RosterCommand> {
        &self.undo
    }

    pub async fn reload(&mut self) -> anyhow::Result<usize> {
        let sort = self.settings.sort;
        let filter = self.settings.filter();
        self.index
            .fetch(&*self.store, &filter, &|a, b| sort.compare(a, b))
            .await
    }

    pub async fn search(&mut self, query: &str) -> anyhow::Result<usize> {
        let sort = self.settings.sort;
        let filter = self.settings.filter();
        self.index
            .search(&*self.store, &filter, query, &|a, b| sort.compare(a, b))
            .await
    }

    /// Switches shape. Returns `false` when already in `mode`.
    pub fn set_mode(&mut self, mode: ViewMode) -> bool {
        if self.settings.mode == mode {
            return false;
        }
        let sort = self.settings.sort;
        self.index
            .convert(mode == ViewMode::Grouped, &|a, b| sort.compare(a, b));
        self.settings.mode = mode;
        true
    }

    pub fn set_sort(&mut self, sort: SortDescriptor) {
        self.settings.sort = sort;
        self.index.sort(&|a, b| sort.compare(a, b));
    }

    /// Adopts new settings, refetching only when the visible set changes.
    pub async fn apply_settings(&mut self, next: RosterSettings) -> anyhow::Result<()> {
        let refetch = next.hide_withdrawn != self.settings.hide_withdrawn
            || next.show_graduated != self.settings.show_graduated;
        self.set_mode(next.mode);
        if next.sort != self.settings.sort {
            self.set_sort(next.sort);
        }
        self.undo.set_limit(next.undo_levels);
        self.settings = next;
        if refetch {
            self.reload().await?;
        }
        Ok(())
    }

    pub async fn create_student(
        &mut self,
        draft: NewStudent,
    ) -> anyhow::Result<(Student, Option<UpdateData>)> {
        if draft.name.trim().is_empty() {
            bail!("student name is required");
        }
        let student = self.store.insert_student(draft).await?;
        let sort = self.settings.sort;
        let update = self
            .settings
            .is_visible(&student)
            .then(|| {
                self.index
                    .relocate(student.clone(), &|a, b| sort.compare(a, b), None)
            });
        Ok((student, update))
    }

    pub async fn delete_student(&mut self, id: StudentId) -> anyhow::Result<Option<UpdateData>> {
        if !self.store.delete_student(id).await? {
            return Ok(None);
        }
        Ok(self.index.remove_student(id).map(|(_, u)| u))
    }

    /// Edits one field and registers its inverse.
    pub async fn edit_field(
        &mut self,
        id: StudentId,
        column: StudentColumn,
        value: &str,
        column_index: Option<usize>,
    ) -> anyhow::Result<Option<UpdateData>> {
        if column == StudentColumn::Id {
            bail!("student id is not editable");
        }
        let old_value = match self.index.student(id) {
            Some(s) => s.value(column),
            None => match self.store.fetch_student(id).await? {
                Some(s) => s.value(column),
                None => bail!("student {id} not found"),
            },
        };
        let update = self.write_field(id, column, value, column_index).await?;
        self.undo.register(RosterCommand::RevertField(FieldEdit {
            student_id: id,
            column,
            old_value,
            new_value: value.to_string(),
        }));
        Ok(update)
    }

    async fn write_field(
        &mut self,
        id: StudentId,
        column: StudentColumn,
        value: &str,
        column_index: Option<usize>,
    ) -> anyhow::Result<Option<UpdateData>> {
        let sort = self.settings.sort;
        self.index
            .update_field_and_persist(
                &*self.store,
                &self.events,
                id,
                column,
                value,
                &|a, b| sort.compare(a, b),
                column_index,
            )
            .await
    }

    /// Hides or reveals withdrawn students. Removals are reported high to low.
    /// The setting only changes once the index has caught up.
    pub async fn set_hide_withdrawn(&mut self, hide: bool) -> anyhow::Result<Vec<UpdateData>> {
        let next = RosterSettings {
            hide_withdrawn: hide,
            ..self.settings.clone()
        };
        let sort = next.sort;
        let rows = self
            .index
            .filter_withdrawn(hide, &|a, b| sort.compare(a, b), &*self.store, &next.filter())
            .await?;
        self.settings = next;
        Ok(self.apply_filter_rows(rows, hide))
    }

    pub async fn set_show_graduated(&mut self, show: bool) -> anyhow::Result<Vec<UpdateData>> {
        let next = RosterSettings {
            show_graduated: show,
            ..self.settings.clone()
        };
        let sort = next.sort;
        let rows = self
            .index
            .filter_graduated(show, &|a, b| sort.compare(a, b), &*self.store, &next.filter())
            .await?;
        self.settings = next;
        Ok(self.apply_filter_rows(rows, !show))
    }

    fn apply_filter_rows(&mut self, rows: Vec<usize>, narrowing: bool) -> Vec<UpdateData> {
        debug!(rows = rows.len(), narrowing, "filter changed");
        if !narrowing {
            return rows
                .into_iter()
                .map(|index| UpdateData::Insert {
                    index,
                    select_row: false,
                    extend_selection: true,
                })
                .collect();
        }
        rows.into_iter()
            .rev()
            .filter_map(|row| {
                self.index.remove_at(row)?;
                Some(UpdateData::Remove { index: row })
            })
            .collect()
    }

    pub async fn undo(&mut self) -> anyhow::Result<Option<Vec<UpdateData>>> {
        let Some(command) = self.undo.take_undo() else {
            return Ok(None);
        };
        self.run_history(command).await.map(Some)
    }

    pub async fn redo(&mut self) -> anyhow::Result<Option<Vec<UpdateData>>> {
        let Some(command) = self.undo.take_redo() else {
            return Ok(None);
        };
        self.run_history(command).await.map(Some)
    }

    // A command that fails stays on its stack so it can be retried.
    async fn run_history(&mut self, command: RosterCommand) -> anyhow::Result<Vec<UpdateData>> {
        match self.perform(command.clone()).await {
            Ok(updates) => {
                self.undo.finish();
                Ok(updates)
            }
            Err(e) => {
                warn!(command = command.label(), error = %e, "history command failed");
                self.undo.restore(command);
                Err(e)
            }
        }
    }

    async fn perform(&mut self, command: RosterCommand) -> anyhow::Result<Vec<UpdateData>> {
        debug!(command = command.label(), "performing history command");
        let updates = match command {
            RosterCommand::RevertField(edit) => {
                let sort = self.settings.sort;
                let update = self
                    .index
                    .undo_edit(&edit, &*self.store, &self.events, &|a, b| sort.compare(a, b))
                    .await?;
                self.undo.register(RosterCommand::ReapplyField(edit));
                update.into_iter().collect()
            }
            RosterCommand::ReapplyField(edit) => {
                let sort = self.settings.sort;
                let update = self
                    .index
                    .redo_edit(&edit, &*self.store, &self.events, &|a, b| sort.compare(a, b))
                    .await?;
                self.undo.register(RosterCommand::RevertField(edit));
                update.into_iter().collect()
            }
            RosterCommand::UndoTransition(batch) => self.undo_transition(batch).await?,
            RosterCommand::RedoTransition { transition, ids } => {
                let outcome = self.apply_transition(transition, &ids).await?;
                if !outcome.failed.is_empty() {
                    warn!(failed = outcome.failed.len(), "redo left some students unchanged");
                }
                outcome.updates
            }
        };
        Ok(updates)
    }
}

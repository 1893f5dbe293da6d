//! In-memory projection of the student table.
//!
//! Two shapes share one contract: [`FlatIndex`] keeps a single sorted list and
//! [`GroupedIndex`] keeps one sorted bucket per class with a header row in front
//! of each bucket. Every mutation reports its effect as [`UpdateData`] in
//! absolute row indices of whichever shape is active.

pub mod flat;
pub mod grouped;

pub use flat::FlatIndex;
pub use grouped::{GroupedIndex, RowInfo};

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use crate::events::{EventBus, RosterEvent};
use crate::model::{FieldEdit, Student, StudentColumn, StudentId, StudentStatus};
use crate::store::{RosterStore, StudentFilter};

pub type Comparator<'a> = &'a dyn Fn(&Student, &Student) -> Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UpdateData {
    #[serde(rename_all = "camelCase")]
    Insert {
        index: usize,
        select_row: bool,
        extend_selection: bool,
    },
    Remove {
        index: usize,
    },
    Move {
        from: usize,
        to: usize,
    },
    #[serde(rename_all = "camelCase")]
    MoveRowAndReloadColumn {
        from: usize,
        to: usize,
        column_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    Reload {
        index: usize,
        select_row: bool,
        extend_selection: bool,
    },
}

pub trait RosterSource {
    fn row_count(&self) -> usize;

    /// Every student in display order, header rows excluded.
    fn flat(&self) -> Vec<Student>;

    fn student_at(&self, row: usize) -> Option<&Student>;
    fn student(&self, id: StudentId) -> Option<&Student>;
    fn student_mut(&mut self, id: StudentId) -> Option<&mut Student>;
    fn index_of(&self, id: StudentId) -> Option<usize>;

    /// Replaces the student with the same id in place. `None` when absent.
    fn update(&mut self, student: Student) -> Option<usize>;

    fn remove_at(&mut self, row: usize) -> Option<Student>;

    /// Inserts at the sorted position and returns its absolute row. A student
    /// already present is left alone and its current row is returned.
    fn insert(&mut self, student: Student, cmp: Comparator<'_>) -> usize;

    fn sort(&mut self, cmp: Comparator<'_>);
    fn load(&mut self, students: Vec<Student>, cmp: Comparator<'_>);
    fn clear(&mut self);

    /// Absolute rows of the students matching `pred`, ascending.
    fn rows_where(&self, pred: &dyn Fn(&Student) -> bool) -> Vec<usize>;

    fn remove_student(&mut self, id: StudentId) -> Option<(usize, UpdateData)> {
        let row = self.index_of(id)?;
        self.remove_at(row)?;
        Some((row, UpdateData::Remove { index: row }))
    }

    fn relocate(
        &mut self,
        student: Student,
        cmp: Comparator<'_>,
        column_index: Option<usize>,
    ) -> UpdateData {
        let Some(from) = self.index_of(student.id) else {
            let index = self.insert(student, cmp);
            return UpdateData::Insert {
                index,
                select_row: true,
                extend_selection: true,
            };
        };
        self.remove_at(from);
        let to = self.insert(student, cmp);
        match (from == to, column_index) {
            (_, Some(column_index)) => UpdateData::MoveRowAndReloadColumn {
                from,
                to,
                column_index,
            },
            (true, None) => UpdateData::Reload {
                index: to,
                select_row: true,
                extend_selection: true,
            },
            (false, None) => UpdateData::Move { from, to },
        }
    }

    fn students_in(&self, rows: &[usize]) -> Vec<Student> {
        rows.iter()
            .filter_map(|r| self.student_at(*r).cloned())
            .collect()
    }

    fn ids_in(&self, rows: &[usize]) -> Vec<StudentId> {
        rows.iter()
            .filter_map(|r| self.student_at(*r).map(|s| s.id))
            .collect()
    }

    fn rows_for(&self, ids: &[StudentId]) -> Vec<usize> {
        let mut rows: Vec<usize> = ids.iter().filter_map(|id| self.index_of(*id)).collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }
}

/// The active shape of the roster.
#[derive(Debug, Clone)]
pub enum RosterIndex {
    Flat(FlatIndex),
    Grouped(GroupedIndex),
}

impl Default for RosterIndex {
    fn default() -> Self {
        RosterIndex::Flat(FlatIndex::default())
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            RosterIndex::Flat($inner) => $body,
            RosterIndex::Grouped($inner) => $body,
        }
    };
}

impl RosterSource for RosterIndex {
    fn row_count(&self) -> usize {
        delegate!(self, i => i.row_count())
    }
    fn flat(&self) -> Vec<Student> {
        delegate!(self, i => i.flat())
    }
    fn student_at(&self, row: usize) -> Option<&Student> {
        delegate!(self, i => i.student_at(row))
    }
    fn student(&self, id: StudentId) -> Option<&Student> {
        delegate!(self, i => i.student(id))
    }
    fn student_mut(&mut self, id: StudentId) -> Option<&mut Student> {
        delegate!(self, i => i.student_mut(id))
    }
    fn index_of(&self, id: StudentId) -> Option<usize> {
        delegate!(self, i => i.index_of(id))
    }
    fn update(&mut self, student: Student) -> Option<usize> {
        delegate!(self, i => i.update(student))
    }
    fn remove_at(&mut self, row: usize) -> Option<Student> {
        delegate!(self, i => i.remove_at(row))
    }
    fn insert(&mut self, student: Student, cmp: Comparator<'_>) -> usize {
        delegate!(self, i => i.insert(student, cmp))
    }
    fn sort(&mut self, cmp: Comparator<'_>) {
        delegate!(self, i => i.sort(cmp))
    }
    fn load(&mut self, students: Vec<Student>, cmp: Comparator<'_>) {
        delegate!(self, i => i.load(students, cmp))
    }
    fn clear(&mut self) {
        delegate!(self, i => i.clear())
    }
    fn rows_where(&self, pred: &dyn Fn(&Student) -> bool) -> Vec<usize> {
        delegate!(self, i => i.rows_where(pred))
    }
}

impl RosterIndex {
    pub fn is_grouped(&self) -> bool {
        matches!(self, RosterIndex::Grouped(_))
    }

    pub fn as_grouped(&self) -> Option<&GroupedIndex> {
        match self {
            RosterIndex::Grouped(g) => Some(g),
            RosterIndex::Flat(_) => None,
        }
    }

    /// Rebuilds the content in the other shape, keeping every student.
    pub fn convert(&mut self, grouped: bool, cmp: Comparator<'_>) {
        if self.is_grouped() == grouped {
            return;
        }
        let students = self.flat();
        let mut next = if grouped {
            RosterIndex::Grouped(GroupedIndex::default())
        } else {
            RosterIndex::Flat(FlatIndex::default())
        };
        next.load(students, cmp);
        *self = next;
    }

    /// Replaces the whole content from the store. On error the previous content
    /// stays in place.
    pub async fn fetch<S: RosterStore + ?Sized>(
        &mut self,
        store: &S,
        filter: &StudentFilter,
        cmp: Comparator<'_>,
    ) -> anyhow::Result<usize> {
        let students = store.fetch_students(filter).await?;
        let n = students.len();
        self.load(students, cmp);
        debug!(rows = n, "roster fetched");
        Ok(n)
    }

    pub async fn search<S: RosterStore + ?Sized>(
        &mut self,
        store: &S,
        filter: &StudentFilter,
        query: &str,
        cmp: Comparator<'_>,
    ) -> anyhow::Result<usize> {
        let mut filter = filter.clone();
        let q = query.trim();
        filter.search = if q.is_empty() {
            None
        } else {
            Some(q.to_string())
        };
        self.fetch(store, &filter, cmp).await
    }

    /// Persists one field, mirrors it on the cached student and moves the row
    /// to wherever the new value sorts (or buckets) it. `None` when the student
    /// is not in the current view.
    pub async fn update_field_and_persist<S: RosterStore + ?Sized>(
        &mut self,
        store: &S,
        events: &EventBus,
        id: StudentId,
        column: StudentColumn,
        value: &str,
        cmp: Comparator<'_>,
        column_index: Option<usize>,
    ) -> anyhow::Result<Option<UpdateData>> {
        let persisted = store.update_field(id, column, value).await?;
        if !persisted {
            debug!(student_id = id, ?column, "derived column, store write skipped");
        }

        if let Some(student) = self.student_mut(id) {
            student.set_value(column, value);
            let edited = student.clone();
            let update = self.relocate(edited.clone(), cmp, column_index);
            events.publish(RosterEvent::Edited {
                student: edited,
                row: self.index_of(id),
            });
            return Ok(Some(update));
        }

        match store.fetch_student(id).await? {
            Some(s) => events.publish(RosterEvent::EditedDetached {
                student_id: id,
                name: s.name,
                class_label: s.class_level.label(),
            }),
            None => warn!(student_id = id, "edited student no longer exists"),
        }
        Ok(None)
    }

    pub async fn undo_edit<S: RosterStore + ?Sized>(
        &mut self,
        edit: &FieldEdit,
        store: &S,
        events: &EventBus,
        cmp: Comparator<'_>,
    ) -> anyhow::Result<Option<UpdateData>> {
        self.update_field_and_persist(
            store,
            events,
            edit.student_id,
            edit.column,
            &edit.old_value,
            cmp,
            None,
        )
        .await
    }

    pub async fn redo_edit<S: RosterStore + ?Sized>(
        &mut self,
        edit: &FieldEdit,
        store: &S,
        events: &EventBus,
        cmp: Comparator<'_>,
    ) -> anyhow::Result<Option<UpdateData>> {
        self.update_field_and_persist(
            store,
            events,
            edit.student_id,
            edit.column,
            &edit.new_value,
            cmp,
            None,
        )
        .await
    }

    /// Rows of withdrawn students. Hiding reads the current content; showing
    /// refetches first, so the rows point at the freshly revealed students.
    pub async fn filter_withdrawn<S: RosterStore + ?Sized>(
        &mut self,
        hide: bool,
        cmp: Comparator<'_>,
        store: &S,
        filter: &StudentFilter,
    ) -> anyhow::Result<Vec<usize>> {
        let is_withdrawn = |s: &Student| s.status == StudentStatus::Withdrawn;
        if !hide {
            self.fetch(store, filter, cmp).await?;
        }
        Ok(self.rows_where(&is_withdrawn))
    }

    pub async fn filter_graduated<S: RosterStore + ?Sized>(
        &mut self,
        show: bool,
        cmp: Comparator<'_>,
        store: &S,
        filter: &StudentFilter,
    ) -> anyhow::Result<Vec<usize>> {
        let is_graduated = |s: &Student| s.status == StudentStatus::Graduated;
        if show {
            self.fetch(store, filter, cmp).await?;
        }
        Ok(self.rows_where(&is_graduated))
    }
}

//! Batched enrollment transitions: promote, graduate, withdraw, reactivate.
//!
//! Each student of a batch runs as its own task; the batch waits for all of
//! them before touching the index. Only students whose store write succeeded
//! are reflected in memory, so a failed write never leaves a stale row.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::events::RosterEvent;
use crate::model::{
    PromotionContext, Student, StudentId, StudentStatus, DEFAULT_CLASS_NAME, MAX_LEVEL,
};
use crate::roster::{RosterSource, UpdateData};
use crate::session::{RosterCommand, RosterSession};
use crate::store::{PromotionRequest, RosterStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Transition {
    Promote { level: u32, year: String, term: String },
    SetStatus { status: StudentStatus },
}

impl Transition {
    pub fn status(&self) -> StudentStatus {
        match self {
            Transition::Promote { .. } => StudentStatus::Promoted,
            Transition::SetStatus { status } => *status,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.status() {
            StudentStatus::Promoted => "promote",
            StudentStatus::Active => "reactivate",
            StudentStatus::Graduated => "graduate",
            StudentStatus::Withdrawn => "withdraw",
        }
    }
}

/// A stored batch, ready to be reverted as a whole.
#[derive(Debug, Clone)]
pub struct TransitionBatch {
    pub transition: Transition,
    pub ids: Vec<StudentId>,
    pub contexts: Vec<PromotionContext>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Completion order.
    pub contexts: Vec<PromotionContext>,
    pub failed: Vec<(StudentId, String)>,
    pub updates: Vec<UpdateData>,
    input: Vec<StudentId>,
}

impl BatchOutcome {
    pub fn contexts_in_input_order(&self) -> Vec<&PromotionContext> {
        self.input
            .iter()
            .filter_map(|id| self.contexts.iter().find(|c| c.student_id == *id))
            .collect()
    }

    pub fn succeeded(&self) -> Vec<StudentId> {
        self.contexts_in_input_order()
            .into_iter()
            .map(|c| c.student_id)
            .collect()
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

fn dedup_ids(ids: &[StudentId]) -> Vec<StudentId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// The cached student as it looks after `ctx` was stored.
fn staged(mut student: Student, ctx: &PromotionContext) -> Student {
    match ctx.status {
        StudentStatus::Promoted | StudentStatus::Active => {
            student.status = StudentStatus::Active;
            student.exit_date.clear();
        }
        other => {
            student.status = other;
            student.exit_date = ctx.date.clone();
        }
    }
    student.class_level = ctx.current_class;
    student
}

fn event_for(ctx: &PromotionContext) -> RosterEvent {
    let student_id = ctx.student_id;
    let class_label = ctx.current_class.label();
    match ctx.status {
        StudentStatus::Promoted => RosterEvent::Promoted {
            student_id,
            class_label,
        },
        StudentStatus::Active => RosterEvent::Reactivated {
            student_id,
            class_label,
        },
        status => RosterEvent::StatusChanged {
            student_id,
            class_label,
            status,
        },
    }
}

impl<S: RosterStore + ?Sized> RosterSession<S> {
    pub async fn promote(
        &mut self,
        ids: &[StudentId],
        level: u32,
        year: &str,
        term: &str,
    ) -> anyhow::Result<BatchOutcome> {
        if !(1..=MAX_LEVEL).contains(&level) {
            bail!("class level {level} is outside 1..={MAX_LEVEL}");
        }
        if year.trim().is_empty() || term.trim().is_empty() {
            bail!("promotion needs a school year and a term");
        }
        let transition = Transition::Promote {
            level,
            year: year.trim().to_string(),
            term: term.trim().to_string(),
        };
        self.apply_transition(transition, ids).await
    }

    pub async fn set_status(
        &mut self,
        ids: &[StudentId],
        status: StudentStatus,
    ) -> anyhow::Result<BatchOutcome> {
        if status == StudentStatus::Promoted {
            bail!("promotion needs a target class");
        }
        self.apply_transition(Transition::SetStatus { status }, ids)
            .await
    }

    /// Cached copies of `ids`, loading the ones outside the current view.
    async fn snapshot(&self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.index.student(*id) {
                Some(s) => found.push(s.clone()),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            found.extend(self.store.fetch_students_by_ids(missing).await?);
        }
        Ok(found)
    }

    pub(crate) async fn apply_transition(
        &mut self,
        transition: Transition,
        ids: &[StudentId],
    ) -> anyhow::Result<BatchOutcome> {
        let ids = dedup_ids(ids);
        let date = today();
        let status = transition.status();
        let before = self.snapshot(&ids).await?;

        let class_id = match &transition {
            Transition::Promote { level, year, term } => Some(
                self.store
                    .insert_or_get_class_id(DEFAULT_CLASS_NAME, *level, year, term)
                    .await?,
            ),
            Transition::SetStatus { .. } => None,
        };

        let mut tasks = JoinSet::new();
        for &id in &ids {
            let (level, year, term) = match &transition {
                Transition::Promote { level, year, term } => {
                    (Some(*level), Some(year.clone()), Some(term.clone()))
                }
                Transition::SetStatus { .. } => (
                    before
                        .iter()
                        .find(|s| s.id == id)
                        .and_then(|s| s.class_level.level()),
                    None,
                    None,
                ),
            };
            let req = PromotionRequest {
                student_id: id,
                class_id,
                level,
                year,
                term,
                date: date.clone(),
                status,
            };
            let store = Arc::clone(&self.store);
            tasks.spawn(async move { (id, store.promote(req).await) });
        }

        let mut outcome = BatchOutcome {
            input: ids.clone(),
            ..BatchOutcome::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ctx))) => outcome.contexts.push(ctx),
                Ok((id, Err(e))) => {
                    warn!(student_id = id, error = %e, "transition failed");
                    outcome.failed.push((id, format!("{e:#}")));
                }
                Err(e) => warn!(error = %e, "transition task did not finish"),
            }
        }
        for &id in &ids {
            let known = outcome.contexts.iter().any(|c| c.student_id == id)
                || outcome.failed.iter().any(|(f, _)| *f == id);
            if !known {
                outcome.failed.push((id, "task aborted".to_string()));
            }
        }

        let sort = self.settings.sort;
        for ctx in &outcome.contexts {
            let Some(base) = before.iter().find(|s| s.id == ctx.student_id) else {
                continue;
            };
            let next = staged(base.clone(), ctx);
            if self.settings.is_visible(&next) {
                let update = self.index.relocate(next, &|a, b| sort.compare(a, b), None);
                outcome.updates.push(update);
            } else if let Some((_, update)) = self.index.remove_student(ctx.student_id) {
                outcome.updates.push(update);
            }
            self.events.publish(event_for(ctx));
        }

        info!(
            transition = transition.label(),
            requested = ids.len(),
            stored = outcome.contexts.len(),
            "transition batch finished"
        );

        if !outcome.contexts.is_empty() {
            let batch = TransitionBatch {
                transition,
                ids: outcome.succeeded(),
                contexts: outcome
                    .contexts_in_input_order()
                    .into_iter()
                    .cloned()
                    .collect(),
            };
            self.undo.register(RosterCommand::UndoTransition(batch));
        }
        Ok(outcome)
    }

    /// Reverts a stored batch and queues its redo.
    pub(crate) async fn undo_transition(
        &mut self,
        batch: TransitionBatch,
    ) -> anyhow::Result<Vec<UpdateData>> {
        let TransitionBatch {
            transition,
            ids,
            contexts,
        } = batch;
        let mut restored: Vec<(StudentId, String, StudentStatus)> = contexts
            .iter()
            .map(|c| (c.student_id, c.previous_class.label(), c.previous_status))
            .collect();
        self.store.undo_promotions(contexts).await?;

        // Reloaded rather than taken from the batch: students deleted since
        // it ran must stay out of the index.
        let reloaded = self.store.fetch_students_by_ids(ids.clone()).await?;
        let sort = self.settings.sort;
        let mut updates = Vec::with_capacity(ids.len());
        for &id in &ids {
            match reloaded.iter().find(|s| s.id == id) {
                Some(student) if self.settings.is_visible(student) => {
                    let update = self
                        .index
                        .relocate(student.clone(), &|a, b| sort.compare(a, b), None);
                    updates.push(update);
                }
                found => {
                    if found.is_none() {
                        warn!(student_id = id, "student deleted before undo, not restored");
                    }
                    if let Some((_, update)) = self.index.remove_student(id) {
                        updates.push(update);
                    }
                }
            }
        }
        restored.retain(|(id, _, _)| reloaded.iter().any(|s| s.id == *id));
        for (student_id, class_label, status) in restored {
            self.events.publish(RosterEvent::PromotionUndone {
                student_id,
                class_label,
                status,
            });
        }
        info!(transition = transition.label(), students = ids.len(), "transition batch undone");
        self.undo
            .register(RosterCommand::RedoTransition { transition, ids });
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassLevel;

    fn ctx(id: StudentId, status: StudentStatus) -> PromotionContext {
        PromotionContext {
            student_id: id,
            deactivated: Vec::new(),
            new_enrollment_id: None,
            new_entry_class_id: None,
            date: "2024-07-15".into(),
            year: String::new(),
            term: String::new(),
            status,
            previous_status: StudentStatus::Active,
            previous_exit_date: String::new(),
            previous_class: ClassLevel::Level(3),
            current_class: ClassLevel::Level(4),
        }
    }

    #[test]
    fn input_order_is_rederived_from_completion_order() {
        let outcome = BatchOutcome {
            contexts: vec![
                ctx(3, StudentStatus::Promoted),
                ctx(1, StudentStatus::Promoted),
            ],
            failed: vec![(2, "boom".into())],
            updates: Vec::new(),
            input: vec![1, 2, 3],
        };
        assert_eq!(outcome.succeeded(), vec![1, 3]);
    }

    #[test]
    fn staged_student_reflects_status() {
        let mut s = Student::new(1, "Ani");
        s.exit_date = "2023-01-01".into();
        let promoted = staged(s.clone(), &ctx(1, StudentStatus::Promoted));
        assert_eq!(promoted.status, StudentStatus::Active);
        assert_eq!(promoted.class_level, ClassLevel::Level(4));
        assert!(promoted.exit_date.is_empty());

        let gone = staged(s, &ctx(1, StudentStatus::Withdrawn));
        assert_eq!(gone.status, StudentStatus::Withdrawn);
        assert_eq!(gone.exit_date, "2024-07-15");
    }

    #[test]
    fn duplicate_ids_are_collapsed_in_order() {
        assert_eq!(dedup_ids(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }
}

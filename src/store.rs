//! Persistence behind the roster.
//!
//! [`RosterStore`] is the async seam the index and the promotion workflow
//! talk to; [`SqliteStore`] is the workspace-backed implementation. Every
//! connection access goes through one mutex and runs on the blocking pool.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::config::RosterSettings;
use crate::db;
use crate::model::{
    ClassLevel, DeactivatedEntry, Gender, NewStudent, PromotionContext, Student, StudentColumn,
    StudentId, StudentStatus,
};

const SEARCH_LEVEL_PREFIX: &str = "kelas ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentFilter {
    pub hide_withdrawn: bool,
    pub show_graduated: bool,
    pub search: Option<String>,
}

/// One student's requested transition. `class_id` is the resolved target
/// class, shared by every student of a promotion batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub student_id: StudentId,
    pub class_id: Option<i64>,
    pub level: Option<u32>,
    pub year: Option<String>,
    pub term: Option<String>,
    pub date: String,
    pub status: StudentStatus,
}

#[async_trait]
pub trait RosterStore: Send + Sync + 'static {
    async fn fetch_students(&self, filter: &StudentFilter) -> anyhow::Result<Vec<Student>>;
    async fn fetch_student(&self, id: StudentId) -> anyhow::Result<Option<Student>>;
    async fn fetch_students_by_ids(&self, ids: Vec<StudentId>) -> anyhow::Result<Vec<Student>>;
    async fn insert_student(&self, draft: NewStudent) -> anyhow::Result<Student>;
    async fn delete_student(&self, id: StudentId) -> anyhow::Result<bool>;

    /// Writes one field. Returns `false` without touching storage when the
    /// column is derived.
    async fn update_field(
        &self,
        id: StudentId,
        column: StudentColumn,
        value: &str,
    ) -> anyhow::Result<bool>;

    async fn insert_or_get_class_id(
        &self,
        name: &str,
        level: u32,
        year: &str,
        term: &str,
    ) -> anyhow::Result<i64>;

    async fn promote(&self, req: PromotionRequest) -> anyhow::Result<PromotionContext>;

    /// Reverts a whole batch in one transaction.
    async fn undo_promotions(&self, contexts: Vec<PromotionContext>) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let conn = db::open_db(workspace)
            .with_context(|| format!("open workspace {}", workspace.display()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn load_settings(&self) -> anyhow::Result<RosterSettings> {
        RosterSettings::load(&lock(&self.conn))
    }

    pub fn save_settings(&self, settings: &RosterSettings) -> anyhow::Result<()> {
        settings.save(&lock(&self.conn))
    }

    /// Runs `f` against the connection on the caller's thread.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut guard = lock(&self.conn);
        f(&mut guard)
    }

    async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            f(&mut guard)
        })
        .await?
    }

    /// Blocking by-id load: one scoped thread per id, results gathered under a
    /// lock, returns once every thread is done. Missing ids are skipped.
    pub fn load_students_blocking(&self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>> {
        let found = Mutex::new(Vec::with_capacity(ids.len()));
        let failures = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for &id in ids {
                let found = &found;
                let failures = &failures;
                scope.spawn(move || match self.with_conn(|c| query_student(c, id)) {
                    Ok(Some(s)) => lock(found).push(s),
                    Ok(None) => debug!(student_id = id, "student vanished before load"),
                    Err(e) => lock(failures).push(e),
                });
            }
        });
        let mut failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = failures.pop() {
            return Err(e);
        }
        Ok(found.into_inner().unwrap_or_else(|p| p.into_inner()))
    }
}

const STUDENT_SELECT: &str = "SELECT s.id, s.name, s.address, s.birth_place_date, s.enrolled_on,
        s.guardian, s.nis, s.nisn, s.father, s.mother, s.gender, s.status, s.exit_date,
        s.phone, c.level
     FROM students s
     LEFT JOIN enrollments e ON e.id = (
        SELECT MAX(e2.id) FROM enrollments e2
        WHERE e2.student_id = s.id AND e2.status IN (1, 2, 3)
     )
     LEFT JOIN classes c ON c.id = e.class_id";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    let status_code: i64 = r.get(11)?;
    let level: Option<i64> = r.get(14)?;
    Ok(Student {
        id: r.get(0)?,
        name: r.get(1)?,
        address: r.get(2)?,
        birth_place_date: r.get(3)?,
        enrolled_on: r.get(4)?,
        guardian: r.get(5)?,
        nis: r.get(6)?,
        nisn: r.get(7)?,
        father: r.get(8)?,
        mother: r.get(9)?,
        gender: Gender::from_code(r.get(10)?),
        status: StudentStatus::from_code(status_code).unwrap_or(StudentStatus::Active),
        exit_date: r.get(12)?,
        phone: r.get(13)?,
        class_level: level
            .and_then(|n| u32::try_from(n).ok())
            .map(ClassLevel::Level)
            .unwrap_or(ClassLevel::Unassigned),
    })
}

fn query_student(conn: &Connection, id: StudentId) -> anyhow::Result<Option<Student>> {
    let sql = format!("{STUDENT_SELECT} WHERE s.id = ?");
    Ok(conn.query_row(&sql, [id], student_from_row).optional()?)
}

fn query_students(conn: &Connection, filter: &StudentFilter) -> anyhow::Result<Vec<Student>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if filter.hide_withdrawn {
        clauses.push("s.status != ?".into());
        args.push(Value::Integer(StudentStatus::Withdrawn.code()));
    }
    if !filter.show_graduated {
        clauses.push("s.status != ?".into());
        args.push(Value::Integer(StudentStatus::Graduated.code()));
    }
    if let Some(q) = filter.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let lowered = q.to_lowercase();
        match lowered.strip_prefix(SEARCH_LEVEL_PREFIX) {
            Some(rest) if rest.trim().parse::<u32>().is_ok() => {
                clauses.push("c.level = ?".into());
                args.push(Value::Integer(rest.trim().parse::<i64>()?));
            }
            _ => {
                let cols = [
                    "s.name", "s.address", "s.nis", "s.nisn", "s.father", "s.mother",
                    "s.guardian", "s.phone",
                ];
                let like = cols
                    .iter()
                    .map(|c| format!("{c} LIKE ?"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                clauses.push(format!("({like})"));
                for _ in cols {
                    args.push(Value::Text(format!("%{q}%")));
                }
            }
        }
    }

    let mut sql = STUDENT_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY s.name, s.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn class_id_for(
    conn: &Connection,
    name: &str,
    level: u32,
    year: &str,
    term: &str,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO classes(name, level, school_year, term) VALUES(?, ?, ?, ?)
         ON CONFLICT(name, level, school_year, term) DO NOTHING",
        params![name, level, year, term],
    )?;
    let id = conn.query_row(
        "SELECT id FROM classes WHERE name = ? AND level = ? AND school_year = ? AND term = ?",
        params![name, level, year, term],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn current_class(conn: &Connection, id: StudentId) -> anyhow::Result<ClassLevel> {
    let level: Option<i64> = conn
        .query_row(
            "SELECT c.level FROM enrollments e JOIN classes c ON c.id = e.class_id
             WHERE e.id = (
                SELECT MAX(id) FROM enrollments WHERE student_id = ? AND status IN (1, 2, 3)
             )",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(level
        .and_then(|n| u32::try_from(n).ok())
        .map(ClassLevel::Level)
        .unwrap_or(ClassLevel::Unassigned))
}

fn snapshot_rows(
    tx: &Transaction<'_>,
    sql: &str,
    args: Vec<Value>,
) -> anyhow::Result<Vec<DeactivatedEntry>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(DeactivatedEntry {
                enrollment_id: r.get(0)?,
                previous_status_code: r.get(1)?,
                previous_exit_date: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn promote_in_tx(tx: &Transaction<'_>, req: &PromotionRequest) -> anyhow::Result<PromotionContext> {
    let id = req.student_id;
    let Some((prev_code, prev_exit)) = tx
        .query_row(
            "SELECT status, exit_date FROM students WHERE id = ?",
            [id],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?
    else {
        bail!("student {id} not found");
    };
    let previous_status = StudentStatus::from_code(prev_code).unwrap_or(StudentStatus::Active);
    if req.status == StudentStatus::Active && previous_status == StudentStatus::Active {
        bail!("student {id} is already active");
    }
    let previous_class = current_class(tx, id)?;

    let target = match (req.level, req.year.as_deref(), req.term.as_deref()) {
        (Some(l), Some(y), Some(t)) => Some((l, y.to_string(), t.to_string())),
        _ => None,
    };

    let mut deactivated = if req.status == StudentStatus::Active {
        snapshot_rows(
            tx,
            "SELECT id, status, exited_on FROM enrollments
             WHERE student_id = ? AND status != 1 ORDER BY id DESC LIMIT 1",
            vec![Value::Integer(id)],
        )?
    } else if let Some((level, year, term)) = &target {
        snapshot_rows(
            tx,
            "SELECT e.id, e.status, e.exited_on FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ? AND e.status = 1
               AND (c.school_year != ? OR c.level != ? OR c.term != ?)",
            vec![
                Value::Integer(id),
                Value::Text(year.clone()),
                Value::Integer(i64::from(*level)),
                Value::Text(term.clone()),
            ],
        )?
    } else {
        snapshot_rows(
            tx,
            "SELECT id, status, exited_on FROM enrollments WHERE student_id = ? AND status = 1",
            vec![Value::Integer(id)],
        )?
    };

    let exit_for_rows = (req.status != StudentStatus::Active).then(|| req.date.clone());
    for entry in &deactivated {
        tx.execute(
            "UPDATE enrollments SET status = ?, exited_on = ? WHERE id = ?",
            params![req.status.code(), exit_for_rows, entry.enrollment_id],
        )?;
    }

    let mut new_enrollment_id = None;
    if req.status == StudentStatus::Promoted {
        if deactivated.is_empty() {
            // Read-only: these rows are kept for the context, not modified.
            let mut sql = String::from(
                "SELECT e.id, e.status, e.exited_on FROM enrollments e
                 JOIN classes c ON c.id = e.class_id
                 WHERE e.student_id = ? AND e.status != 1",
            );
            let mut args = vec![Value::Integer(id)];
            if let Some((level, year, term)) = &target {
                sql.push_str(" AND (c.school_year = ? OR c.level = ? OR c.term = ?)");
                args.push(Value::Text(year.clone()));
                args.push(Value::Integer(i64::from(*level)));
                args.push(Value::Text(term.clone()));
            }
            deactivated = snapshot_rows(tx, &sql, args)?;
        }

        let Some(class_id) = req.class_id else {
            bail!("promotion of student {id} has no target class");
        };
        let existing: Option<(i64, i64, Option<String>)> = tx
            .query_row(
                "SELECT id, status, exited_on FROM enrollments
                 WHERE student_id = ? AND class_id = ? ORDER BY id DESC LIMIT 1",
                [id, class_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match existing {
            Some((row_id, status, exited_on)) => {
                if !deactivated.iter().any(|e| e.enrollment_id == row_id) {
                    deactivated.push(DeactivatedEntry {
                        enrollment_id: row_id,
                        previous_status_code: status,
                        previous_exit_date: exited_on,
                    });
                }
                tx.execute(
                    "UPDATE enrollments SET status = 1, exited_on = NULL WHERE id = ?",
                    [row_id],
                )?;
                debug!(student_id = id, enrollment_id = row_id, "reactivated existing enrollment");
            }
            None => {
                tx.execute(
                    "INSERT INTO enrollments(student_id, class_id, status, entered_on, exited_on)
                     VALUES(?, ?, 1, ?, NULL)",
                    params![id, class_id, req.date],
                )?;
                new_enrollment_id = Some(tx.last_insert_rowid());
            }
        }
    }

    let (student_status, student_exit) = match req.status {
        StudentStatus::Promoted | StudentStatus::Active => (StudentStatus::Active, String::new()),
        other => (other, req.date.clone()),
    };
    tx.execute(
        "UPDATE students SET status = ?, exit_date = ?, updated_at = ? WHERE id = ?",
        params![student_status.code(), student_exit, req.date, id],
    )?;

    let current_class = current_class(tx, id)?;
    Ok(PromotionContext {
        student_id: id,
        deactivated,
        new_enrollment_id,
        new_entry_class_id: (req.status == StudentStatus::Promoted)
            .then_some(req.class_id)
            .flatten(),
        date: req.date.clone(),
        year: req.year.clone().unwrap_or_default(),
        term: req.term.clone().unwrap_or_default(),
        status: req.status,
        previous_status,
        previous_exit_date: prev_exit,
        previous_class,
        current_class,
    })
}

fn undo_in_tx(tx: &Transaction<'_>, contexts: &[PromotionContext]) -> anyhow::Result<()> {
    let mut touched_classes = BTreeSet::new();
    for ctx in contexts {
        if let Some(row_id) = ctx.new_enrollment_id {
            tx.execute("DELETE FROM enrollments WHERE id = ?", [row_id])?;
        }
        if let Some(class_id) = ctx.new_entry_class_id {
            touched_classes.insert(class_id);
        }
        for entry in &ctx.deactivated {
            tx.execute(
                "UPDATE enrollments SET status = ?, exited_on = ? WHERE id = ?",
                params![
                    entry.previous_status_code,
                    entry.previous_exit_date,
                    entry.enrollment_id
                ],
            )?;
        }
        tx.execute(
            "UPDATE students SET status = ?, exit_date = ? WHERE id = ?",
            params![
                ctx.previous_status.code(),
                ctx.previous_exit_date,
                ctx.student_id
            ],
        )?;
    }
    // A class row goes only once nothing enrolls into it any more.
    for class_id in touched_classes {
        let removed = tx.execute(
            "DELETE FROM classes WHERE id = ?
             AND NOT EXISTS(SELECT 1 FROM enrollments WHERE class_id = ?)",
            [class_id, class_id],
        )?;
        if removed > 0 {
            debug!(class_id, "removed class row left empty by undo");
        }
    }
    Ok(())
}

#[async_trait]
impl RosterStore for SqliteStore {
    async fn fetch_students(&self, filter: &StudentFilter) -> anyhow::Result<Vec<Student>> {
        let filter = filter.clone();
        self.run(move |conn| query_students(conn, &filter)).await
    }

    async fn fetch_student(&self, id: StudentId) -> anyhow::Result<Option<Student>> {
        self.run(move |conn| query_student(conn, id)).await
    }

    async fn fetch_students_by_ids(&self, ids: Vec<StudentId>) -> anyhow::Result<Vec<Student>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_students_blocking(&ids)).await?
    }

    async fn insert_student(&self, draft: NewStudent) -> anyhow::Result<Student> {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let enrolled_on = if draft.enrolled_on.is_empty() {
                today.clone()
            } else {
                draft.enrolled_on.clone()
            };
            tx.execute(
                "INSERT INTO students(name, address, birth_place_date, enrolled_on, guardian,
                    nis, nisn, father, mother, gender, status, exit_date, phone, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, '', ?, ?)",
                params![
                    draft.name,
                    draft.address,
                    draft.birth_place_date,
                    enrolled_on,
                    draft.guardian,
                    draft.nis,
                    draft.nisn,
                    draft.father,
                    draft.mother,
                    draft.gender.unwrap_or(Gender::Male).code(),
                    draft.phone,
                    today,
                ],
            )?;
            let id = tx.last_insert_rowid();
            if let (Some(level), Some(year), Some(term)) =
                (draft.level, draft.year.as_deref(), draft.term.as_deref())
            {
                let class_id =
                    class_id_for(&tx, crate::model::DEFAULT_CLASS_NAME, level, year, term)?;
                tx.execute(
                    "INSERT INTO enrollments(student_id, class_id, status, entered_on, exited_on)
                     VALUES(?, ?, 1, ?, NULL)",
                    params![id, class_id, enrolled_on],
                )?;
            }
            let student = query_student(&tx, id)?.context("inserted student not readable")?;
            tx.commit()?;
            info!(student_id = id, "student created");
            Ok(student)
        })
        .await
    }

    async fn delete_student(&self, id: StudentId) -> anyhow::Result<bool> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM enrollments WHERE student_id = ?", [id])?;
            let n = tx.execute("DELETE FROM students WHERE id = ?", [id])?;
            tx.commit()?;
            Ok(n > 0)
        })
        .await
    }

    async fn update_field(
        &self,
        id: StudentId,
        column: StudentColumn,
        value: &str,
    ) -> anyhow::Result<bool> {
        let Some(col) = column.storage_column() else {
            return Ok(false);
        };
        let stored = match column {
            StudentColumn::Gender => {
                Value::Integer(Gender::from_label(value).unwrap_or(Gender::Male).code())
            }
            _ => Value::Text(value.to_string()),
        };
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.run(move |conn| {
            let sql = format!("UPDATE students SET {col} = ?, updated_at = ? WHERE id = ?");
            let n = conn.execute(&sql, params![stored, now, id])?;
            if n == 0 {
                bail!("student {id} not found");
            }
            Ok(true)
        })
        .await
    }

    async fn insert_or_get_class_id(
        &self,
        name: &str,
        level: u32,
        year: &str,
        term: &str,
    ) -> anyhow::Result<i64> {
        let (name, year, term) = (name.to_string(), year.to_string(), term.to_string());
        self.run(move |conn| class_id_for(conn, &name, level, &year, &term))
            .await
    }

    async fn promote(&self, req: PromotionRequest) -> anyhow::Result<PromotionContext> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let ctx = promote_in_tx(&tx, &req)?;
            tx.commit()?;
            debug!(
                student_id = ctx.student_id,
                status = ctx.status.label(),
                deactivated = ctx.deactivated.len(),
                "transition stored"
            );
            Ok(ctx)
        })
        .await
    }

    async fn undo_promotions(&self, contexts: Vec<PromotionContext>) -> anyhow::Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            undo_in_tx(&tx, &contexts)?;
            tx.commit()?;
            debug!(students = contexts.len(), "transition batch reverted");
            Ok(())
        })
        .await
    }
}

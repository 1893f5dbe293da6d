use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rosterd::config::{RosterSettings, ViewMode};
use rosterd::events::{self, EventBus, RosterEvent};
use rosterd::model::{
    ClassLevel, NewStudent, PromotionContext, Student, StudentColumn, StudentId, StudentStatus,
};
use rosterd::roster::{GroupedIndex, RosterIndex, RosterSource, UpdateData};
use rosterd::session::RosterSession;
use rosterd::store::{PromotionRequest, RosterStore, SqliteStore, StudentFilter};

fn draft(name: &str, level: u32) -> NewStudent {
    NewStudent {
        name: name.to_string(),
        level: Some(level),
        year: Some("2023/2024".to_string()),
        term: Some("1".to_string()),
        ..NewStudent::default()
    }
}

fn session_with<S: RosterStore>(store: S, settings: RosterSettings) -> RosterSession<S> {
    RosterSession::new(Arc::new(store), settings, EventBus::new())
}

async fn seeded(names: &[(&str, u32)]) -> (RosterSession<SqliteStore>, Vec<StudentId>) {
    let store = SqliteStore::open_in_memory().expect("store");
    let mut session = session_with(store, RosterSettings::default());
    let mut ids = Vec::new();
    for (name, level) in names {
        let (s, _) = session
            .create_student(draft(name, *level))
            .await
            .expect("create");
        ids.push(s.id);
    }
    (session, ids)
}

fn enrollment_state(store: &SqliteStore, id: StudentId) -> Vec<(i64, Option<String>, i64)> {
    store
        .with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT e.status, e.exited_on, c.level FROM enrollments e
                 JOIN classes c ON c.id = e.class_id
                 WHERE e.student_id = ? ORDER BY e.id",
            )?;
            let rows = stmt
                .query_map([id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .expect("enrollment state")
}

fn assert_sorted(session: &RosterSession<impl RosterStore>) {
    let sort = session.settings().sort;
    let flat = session.index().flat();
    for pair in flat.windows(2) {
        assert_ne!(
            sort.compare(&pair[0], &pair[1]),
            std::cmp::Ordering::Greater,
            "{} before {}",
            pair[0].name,
            pair[1].name
        );
    }
}

#[tokio::test]
async fn batch_promotion_covers_every_input_id() {
    let (mut session, ids) = seeded(&[
        ("Ani", 1),
        ("Budi", 1),
        ("Citra", 1),
        ("Dewi", 1),
        ("Eka", 1),
    ])
    .await;
    let mut rx = session.events().subscribe();

    let outcome = session
        .promote(&ids, 2, "2024/2025", "1")
        .await
        .expect("promote");

    let got: HashSet<StudentId> = outcome.contexts.iter().map(|c| c.student_id).collect();
    assert_eq!(got, ids.iter().copied().collect());
    assert_eq!(outcome.succeeded(), ids);
    assert!(outcome.failed.is_empty());
    let classes: HashSet<Option<i64>> =
        outcome.contexts.iter().map(|c| c.new_entry_class_id).collect();
    assert_eq!(classes.len(), 1, "one target class per batch");

    for id in &ids {
        let s = session.index().student(*id).expect("still cached");
        assert_eq!(s.class_level, ClassLevel::Level(2));
        assert_eq!(s.status, StudentStatus::Active);
    }
    assert_sorted(&session);

    let promoted = events::drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RosterEvent::Promoted { class_label, .. } if class_label == "Kelas 2"))
        .count();
    assert_eq!(promoted, ids.len());
}

#[tokio::test]
async fn field_edit_undo_and_redo_are_symmetric() {
    let (mut session, ids) = seeded(&[("Ani", 1), ("Budi", 1), ("Citra", 1)]).await;
    let ani = ids[0];

    let update = session
        .edit_field(ani, StudentColumn::Name, "Zahra", None)
        .await
        .expect("edit");
    assert_eq!(update, Some(UpdateData::Move { from: 0, to: 2 }));
    assert_sorted(&session);

    session.undo().await.expect("undo").expect("performed");
    assert_eq!(session.index().student(ani).map(|s| s.name.as_str()), Some("Ani"));
    assert_eq!(session.index().index_of(ani), Some(0));
    let stored = session.store().fetch_student(ani).await.expect("fetch").expect("present");
    assert_eq!(stored.name, "Ani");
    assert!(session.history().can_redo());

    session.redo().await.expect("redo").expect("performed");
    assert_eq!(session.index().student(ani).map(|s| s.name.as_str()), Some("Zahra"));
    let stored = session.store().fetch_student(ani).await.expect("fetch").expect("present");
    assert_eq!(stored.name, "Zahra");
    assert!(session.history().can_undo());
    assert!(!session.history().can_redo());
}

#[tokio::test]
async fn promotion_undo_and_redo_restore_enrollment_state() {
    let (mut session, ids) = seeded(&[("Ani", 3), ("Budi", 3)]).await;
    let before: Vec<_> = ids
        .iter()
        .map(|id| enrollment_state(session.store(), *id))
        .collect();

    session.promote(&ids, 4, "2024/2025", "1").await.expect("promote");
    let promoted: Vec<_> = ids
        .iter()
        .map(|id| enrollment_state(session.store(), *id))
        .collect();
    assert_eq!(promoted[0].len(), 2);
    assert_eq!(promoted[0][0].0, StudentStatus::Promoted.code());

    session.undo().await.expect("undo").expect("performed");
    let undone: Vec<_> = ids
        .iter()
        .map(|id| enrollment_state(session.store(), *id))
        .collect();
    assert_eq!(undone, before);
    for id in &ids {
        assert_eq!(
            session.index().student(*id).map(|s| s.class_level),
            Some(ClassLevel::Level(3))
        );
    }

    session.redo().await.expect("redo").expect("performed");
    let redone: Vec<_> = ids
        .iter()
        .map(|id| enrollment_state(session.store(), *id))
        .collect();
    assert_eq!(redone, promoted);
    assert!(session.history().can_undo());
    assert_sorted(&session);
}

#[tokio::test]
async fn degenerate_promotion_undo_leaves_no_enrollment() {
    let store = SqliteStore::open_in_memory().expect("store");
    let mut session = session_with(store, RosterSettings::default());
    let (s, _) = session
        .create_student(NewStudent {
            name: "Gilang".into(),
            ..NewStudent::default()
        })
        .await
        .expect("create");

    let outcome = session.promote(&[s.id], 4, "2024/2025", "1").await.expect("promote");
    let ctx = outcome.contexts_in_input_order()[0].clone();
    assert!(ctx.deactivated.is_empty());
    assert!(ctx.new_entry_class_id.is_some());

    session.undo().await.expect("undo");
    assert!(enrollment_state(session.store(), s.id).is_empty());
    let classes: i64 = session
        .store()
        .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?))
        .expect("count");
    assert_eq!(classes, 0);
}

/// Delegates to SQLite, failing on demand: one student's transition, list
/// fetches, or batch undo.
struct FlakyStore {
    inner: SqliteStore,
    refuse: Option<StudentId>,
    fail_fetch: AtomicBool,
    fail_undo: AtomicBool,
}

impl FlakyStore {
    fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            refuse: None,
            fail_fetch: AtomicBool::new(false),
            fail_undo: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RosterStore for FlakyStore {
    async fn fetch_students(&self, filter: &StudentFilter) -> anyhow::Result<Vec<Student>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inner.fetch_students(filter).await
    }
    async fn fetch_student(&self, id: StudentId) -> anyhow::Result<Option<Student>> {
        self.inner.fetch_student(id).await
    }
    async fn fetch_students_by_ids(&self, ids: Vec<StudentId>) -> anyhow::Result<Vec<Student>> {
        self.inner.fetch_students_by_ids(ids).await
    }
    async fn insert_student(&self, draft: NewStudent) -> anyhow::Result<Student> {
        self.inner.insert_student(draft).await
    }
    async fn delete_student(&self, id: StudentId) -> anyhow::Result<bool> {
        self.inner.delete_student(id).await
    }
    async fn update_field(
        &self,
        id: StudentId,
        column: StudentColumn,
        value: &str,
    ) -> anyhow::Result<bool> {
        self.inner.update_field(id, column, value).await
    }
    async fn insert_or_get_class_id(
        &self,
        name: &str,
        level: u32,
        year: &str,
        term: &str,
    ) -> anyhow::Result<i64> {
        self.inner.insert_or_get_class_id(name, level, year, term).await
    }
    async fn promote(&self, req: PromotionRequest) -> anyhow::Result<PromotionContext> {
        if Some(req.student_id) == self.refuse {
            anyhow::bail!("disk full");
        }
        self.inner.promote(req).await
    }
    async fn undo_promotions(&self, contexts: Vec<PromotionContext>) -> anyhow::Result<()> {
        if self.fail_undo.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.undo_promotions(contexts).await
    }
}

#[tokio::test]
async fn failed_store_write_leaves_cached_student_untouched() {
    let inner = SqliteStore::open_in_memory().expect("store");
    let a = inner.insert_student(draft("Ani", 2)).await.expect("a").id;
    let b = inner.insert_student(draft("Budi", 2)).await.expect("b").id;
    let store = FlakyStore {
        refuse: Some(b),
        ..FlakyStore::new(inner)
    };
    let mut session = session_with(store, RosterSettings::default());
    session.reload().await.expect("reload");
    let cached_b = session.index().student(b).cloned().expect("b cached");

    let outcome = session
        .promote(&[a, b], 3, "2024/2025", "1")
        .await
        .expect("batch");
    assert_eq!(outcome.succeeded(), vec![a]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, b);

    assert_eq!(session.index().student(b), Some(&cached_b));
    assert_eq!(
        session.index().student(a).map(|s| s.class_level),
        Some(ClassLevel::Level(3))
    );

    // Only the stored student is part of the undo batch.
    session.undo().await.expect("undo");
    assert_eq!(
        session.index().student(a).map(|s| s.class_level),
        Some(ClassLevel::Level(2))
    );
    assert_eq!(session.index().student(b), Some(&cached_b));
}

#[tokio::test]
async fn hiding_withdrawn_reports_descending_removals() {
    let (mut session, ids) = seeded(&[("Ani", 1), ("Budi", 2), ("Citra", 3), ("Dewi", 4)]).await;
    session
        .set_status(&[ids[0], ids[2]], StudentStatus::Withdrawn)
        .await
        .expect("withdraw");
    let rows_before = session
        .index()
        .rows_where(&|s| s.status == StudentStatus::Withdrawn);
    assert_eq!(rows_before, vec![0, 2]);

    let removed = session.set_hide_withdrawn(true).await.expect("hide");
    assert_eq!(
        removed,
        vec![UpdateData::Remove { index: 2 }, UpdateData::Remove { index: 0 }]
    );
    assert_eq!(session.index().row_count(), 2);

    let shown = session.set_hide_withdrawn(false).await.expect("show");
    let rows: Vec<usize> = shown
        .iter()
        .map(|u| match u {
            UpdateData::Insert { index, .. } => *index,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(rows, vec![0, 2]);
    assert_eq!(session.index().row_count(), 4);
}

#[tokio::test]
async fn graduating_hidden_students_removes_and_undo_restores_rows() {
    let store = SqliteStore::open_in_memory().expect("store");
    let settings = RosterSettings {
        show_graduated: false,
        ..RosterSettings::default()
    };
    let mut session = session_with(store, settings);
    let (s, _) = session.create_student(draft("Hana", 6)).await.expect("create");
    let (t, _) = session.create_student(draft("Irfan", 6)).await.expect("create");

    let outcome = session
        .set_status(&[s.id], StudentStatus::Graduated)
        .await
        .expect("graduate");
    assert_eq!(outcome.updates, vec![UpdateData::Remove { index: 0 }]);
    assert!(session.index().student(s.id).is_none());
    assert!(session.index().student(t.id).is_some());

    let updates = session.undo().await.expect("undo").expect("performed");
    assert!(matches!(updates[0], UpdateData::Insert { index: 0, .. }));
    let back = session.index().student(s.id).expect("visible again");
    assert_eq!(back.status, StudentStatus::Active);
    assert_eq!(back.class_level, ClassLevel::Level(6));
}

#[tokio::test]
async fn editing_a_hidden_student_persists_and_reports_detached() {
    let (mut session, ids) = seeded(&[("Joko", 2), ("Kiki", 2)]).await;
    session
        .set_status(&[ids[0]], StudentStatus::Withdrawn)
        .await
        .expect("withdraw");
    session.set_hide_withdrawn(true).await.expect("hide");
    let mut rx = session.events().subscribe();

    let update = session
        .edit_field(ids[0], StudentColumn::Phone, "0812-555", None)
        .await
        .expect("edit");
    assert_eq!(update, None);
    let stored = session.store().fetch_student(ids[0]).await.expect("fetch").expect("present");
    assert_eq!(stored.phone, "0812-555");
    let got = events::drain(&mut rx);
    assert!(matches!(
        got.as_slice(),
        [RosterEvent::EditedDetached { student_id, .. }] if *student_id == ids[0]
    ));
}

#[tokio::test]
async fn grouped_mode_moves_rows_between_sections() {
    let (mut session, ids) = seeded(&[("Ani", 1), ("Budi", 1), ("Citra", 2)]).await;
    assert!(session.set_mode(ViewMode::Grouped));
    let grouped = session.index().as_grouped().expect("grouped");
    assert_eq!(grouped.bucket_sizes()[..3], [2, 1, 0]);
    assert_eq!(session.index().index_of(ids[1]), Some(2));

    let outcome = session
        .promote(&[ids[1]], 2, "2024/2025", "1")
        .await
        .expect("promote");
    // Budi leaves section 0 and lands ahead of Citra in section 1.
    assert_eq!(outcome.updates, vec![UpdateData::Move { from: 2, to: 3 }]);
    let grouped = session.index().as_grouped().expect("grouped");
    assert_eq!(grouped.bucket_sizes()[..3], [1, 2, 0]);
    assert!(grouped.is_header_row(2));
}

fn class_count(store: &SqliteStore) -> i64 {
    store
        .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?))
        .expect("class count")
}

#[tokio::test]
async fn undoing_a_batch_skips_students_deleted_since() {
    let (mut session, ids) = seeded(&[("Ani", 1), ("Budi", 1)]).await;
    let (ani, budi) = (ids[0], ids[1]);
    session.promote(&ids, 2, "2024/2025", "1").await.expect("promote");
    session.delete_student(ani).await.expect("delete");

    session.undo().await.expect("undo").expect("performed");
    assert!(session.index().student(ani).is_none());
    assert!(session.store().fetch_student(ani).await.expect("fetch").is_none());
    assert_eq!(
        session.index().student(budi).map(|s| s.class_level),
        Some(ClassLevel::Level(1))
    );
    assert_eq!(session.index().row_count(), 1);

    // Redo runs again for whoever still exists.
    session.redo().await.expect("redo").expect("performed");
    assert!(session.index().student(ani).is_none());
    assert_eq!(
        session.index().student(budi).map(|s| s.class_level),
        Some(ClassLevel::Level(2))
    );
}

#[tokio::test]
async fn reactivating_an_active_student_reports_it_failed() {
    let (mut session, ids) = seeded(&[("Ani", 1)]).await;
    session.promote(&ids, 2, "2024/2025", "1").await.expect("promote");

    let outcome = session
        .set_status(&ids, StudentStatus::Active)
        .await
        .expect("batch");
    assert!(outcome.contexts.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, ids[0]);
    assert!(outcome.updates.is_empty());

    let active = enrollment_state(session.store(), ids[0])
        .into_iter()
        .filter(|(status, _, _)| *status == StudentStatus::Active.code())
        .count();
    assert_eq!(active, 1);
    assert_eq!(
        session.history().peek_undo().map(|c| c.label()),
        Some("promote")
    );
}

#[tokio::test]
async fn failed_refetch_leaves_filter_settings_unchanged() {
    let inner = SqliteStore::open_in_memory().expect("store");
    inner.insert_student(draft("Ani", 1)).await.expect("insert");
    let settings = RosterSettings {
        hide_withdrawn: true,
        show_graduated: false,
        ..RosterSettings::default()
    };
    let mut session = session_with(FlakyStore::new(inner), settings);
    session.reload().await.expect("reload");
    session.store().fail_fetch.store(true, Ordering::SeqCst);

    assert!(session.set_hide_withdrawn(false).await.is_err());
    assert!(session.settings().hide_withdrawn);
    assert!(session.set_show_graduated(true).await.is_err());
    assert!(!session.settings().show_graduated);
    assert_eq!(session.index().row_count(), 1);

    session.store().fail_fetch.store(false, Ordering::SeqCst);
    session.set_hide_withdrawn(false).await.expect("widen");
    assert!(!session.settings().hide_withdrawn);
}

#[tokio::test]
async fn failed_undo_keeps_the_batch_for_a_retry() {
    let inner = SqliteStore::open_in_memory().expect("store");
    let id = inner.insert_student(draft("Ani", 1)).await.expect("insert").id;
    let mut session = session_with(FlakyStore::new(inner), RosterSettings::default());
    session.reload().await.expect("reload");
    session.promote(&[id], 2, "2024/2025", "1").await.expect("promote");

    session.store().fail_undo.store(true, Ordering::SeqCst);
    assert!(session.undo().await.is_err());
    assert_eq!(session.history().undo_len(), 1);
    assert!(!session.history().can_redo());
    assert_eq!(
        session.index().student(id).map(|s| s.class_level),
        Some(ClassLevel::Level(2))
    );

    session.store().fail_undo.store(false, Ordering::SeqCst);
    session.undo().await.expect("retry").expect("performed");
    assert_eq!(
        session.index().student(id).map(|s| s.class_level),
        Some(ClassLevel::Level(1))
    );
    assert!(!session.history().can_undo());
    assert!(session.history().can_redo());
}

#[tokio::test]
async fn hiding_and_showing_graduated_students() {
    let (mut session, ids) = seeded(&[("Ani", 6), ("Budi", 6), ("Citra", 6), ("Dewi", 6)]).await;
    session
        .set_status(&[ids[1], ids[3]], StudentStatus::Graduated)
        .await
        .expect("graduate");
    assert_eq!(
        session
            .index()
            .rows_where(&|s| s.status == StudentStatus::Graduated),
        vec![1, 3]
    );

    let removed = session.set_show_graduated(false).await.expect("hide");
    assert_eq!(
        removed,
        vec![UpdateData::Remove { index: 3 }, UpdateData::Remove { index: 1 }]
    );
    assert_eq!(session.index().row_count(), 2);
    assert!(session.index().student(ids[1]).is_none());

    let shown = session.set_show_graduated(true).await.expect("show");
    let rows: Vec<usize> = shown
        .iter()
        .map(|u| match u {
            UpdateData::Insert { index, .. } => *index,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(rows, vec![1, 3]);
    assert_eq!(session.index().row_count(), 4);
    assert_eq!(session.index().student_at(1).map(|s| s.id), Some(ids[1]));
    assert_eq!(session.index().student_at(3).map(|s| s.id), Some(ids[3]));
}

#[tokio::test]
async fn grouped_edits_reload_the_edited_column() {
    let (mut session, ids) = seeded(&[("Ani", 1), ("Budi", 1), ("Citra", 2)]).await;
    session.set_mode(ViewMode::Grouped);

    let update = session
        .edit_field(ids[0], StudentColumn::Name, "Zaki", Some(1))
        .await
        .expect("rename");
    assert_eq!(
        update,
        Some(UpdateData::MoveRowAndReloadColumn {
            from: 1,
            to: 2,
            column_index: 1
        })
    );

    let update = session
        .edit_field(ids[2], StudentColumn::Phone, "0812", Some(3))
        .await
        .expect("phone");
    assert_eq!(
        update,
        Some(UpdateData::MoveRowAndReloadColumn {
            from: 4,
            to: 4,
            column_index: 3
        })
    );
}

#[tokio::test]
async fn index_edit_moves_the_row_to_its_sorted_place() {
    let store = SqliteStore::open_in_memory().expect("store");
    let mut ids = Vec::new();
    for name in ["Ani", "Budi", "Citra"] {
        ids.push(store.insert_student(draft(name, 3)).await.expect("insert").id);
    }
    let settings = RosterSettings::default();
    let sort = settings.sort;
    let cmp = |a: &Student, b: &Student| sort.compare(a, b);
    let events = EventBus::new();
    let mut index = RosterIndex::Grouped(GroupedIndex::default());
    index
        .fetch(&store, &settings.filter(), &cmp)
        .await
        .expect("fetch");
    assert_eq!(index.index_of(ids[0]), Some(3));

    let update = index
        .update_field_and_persist(&store, &events, ids[0], StudentColumn::Name, "Yuni", &cmp, None)
        .await
        .expect("edit");
    assert_eq!(update, Some(UpdateData::Move { from: 3, to: 5 }));
    let names: Vec<String> = index.flat().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["Budi", "Citra", "Yuni"]);
}

#[tokio::test]
async fn promotion_level_must_be_a_real_class() {
    let (mut session, ids) = seeded(&[("Ani", 1)]).await;
    let classes = class_count(session.store());

    assert!(session.promote(&ids, 7, "2024/2025", "1").await.is_err());
    assert!(session.promote(&ids, 0, "2024/2025", "1").await.is_err());
    assert_eq!(class_count(session.store()), classes);
    assert!(!session.history().can_undo());
    assert_eq!(
        session.index().student(ids[0]).map(|s| s.class_level),
        Some(ClassLevel::Level(1))
    );
}

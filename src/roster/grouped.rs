use std::cmp::Ordering;

use serde::Serialize;

use crate::model::{ClassLevel, Student, StudentId, StudentStatus, MAX_LEVEL};

use super::{Comparator, RosterSource};

pub const BUCKET_COUNT: usize = 8;
pub const GRADUATED_BUCKET: usize = 6;
pub const UNASSIGNED_BUCKET: usize = 7;

const HEADER_LABELS: [&str; BUCKET_COUNT] = [
    "Kelas 1",
    "Kelas 2",
    "Kelas 3",
    "Kelas 4",
    "Kelas 5",
    "Kelas 6",
    "Lulus",
    "Tanpa Kelas",
];

/// What sits at an absolute row of the grouped view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RowInfo {
    Header { section: usize },
    Student { section: usize, offset: usize },
}

impl RowInfo {
    pub fn section(self) -> usize {
        match self {
            RowInfo::Header { section } | RowInfo::Student { section, .. } => section,
        }
    }
}

/// Grouped view: eight class buckets, each preceded by a header row.
///
/// Absolute row of `(section, offset)` is the sum of `len + 1` over the
/// preceding buckets, plus `offset + 1` for the section's own header.
#[derive(Debug, Clone, Default)]
pub struct GroupedIndex {
    buckets: [Vec<Student>; BUCKET_COUNT],
}

/// Bucket a student belongs to: graduated status or the "Lulus" class go to
/// the graduated bucket, levels 1-6 to their own, everything else to the
/// unassigned bucket.
pub fn bucket_for(student: &Student) -> usize {
    if student.status == StudentStatus::Graduated {
        return GRADUATED_BUCKET;
    }
    match student.class_level {
        ClassLevel::Level(n) if (1..=MAX_LEVEL).contains(&n) => (n - 1) as usize,
        ClassLevel::Graduated => GRADUATED_BUCKET,
        _ => UNASSIGNED_BUCKET,
    }
}

impl GroupedIndex {
    pub fn bucket(&self, section: usize) -> &[Student] {
        self.buckets.get(section).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bucket_sizes(&self) -> [usize; BUCKET_COUNT] {
        std::array::from_fn(|g| self.buckets[g].len())
    }

    pub fn header_label(section: usize) -> Option<&'static str> {
        HEADER_LABELS.get(section).copied()
    }

    /// Absolute row of the section's header.
    pub fn section_start(&self, section: usize) -> usize {
        self.buckets[..section.min(BUCKET_COUNT)]
            .iter()
            .map(|b| b.len() + 1)
            .sum()
    }

    pub fn absolute_index(&self, section: usize, offset: usize) -> usize {
        self.section_start(section) + offset + 1
    }

    pub fn row_info(&self, row: usize) -> Option<RowInfo> {
        let mut start = 0;
        for (section, bucket) in self.buckets.iter().enumerate() {
            let span = bucket.len() + 1;
            if row < start + span {
                return Some(if row == start {
                    RowInfo::Header { section }
                } else {
                    RowInfo::Student {
                        section,
                        offset: row - start - 1,
                    }
                });
            }
            start += span;
        }
        None
    }

    pub fn section_for_row(&self, row: usize) -> Option<usize> {
        self.row_info(row).map(RowInfo::section)
    }

    pub fn is_header_row(&self, row: usize) -> bool {
        matches!(self.row_info(row), Some(RowInfo::Header { .. }))
    }

    /// Every row in display order, headers included.
    pub fn rows(&self) -> Vec<(RowInfo, Option<&Student>)> {
        let mut out = Vec::with_capacity(self.row_count());
        for (section, bucket) in self.buckets.iter().enumerate() {
            out.push((RowInfo::Header { section }, None));
            for (offset, s) in bucket.iter().enumerate() {
                out.push((RowInfo::Student { section, offset }, Some(s)));
            }
        }
        out
    }

    fn locate(&self, id: StudentId) -> Option<(usize, usize)> {
        self.buckets.iter().enumerate().find_map(|(g, b)| {
            b.iter().position(|s| s.id == id).map(|r| (g, r))
        })
    }
}

impl RosterSource for GroupedIndex {
    fn row_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len() + 1).sum()
    }

    fn flat(&self) -> Vec<Student> {
        self.buckets.iter().flatten().cloned().collect()
    }

    fn student_at(&self, row: usize) -> Option<&Student> {
        match self.row_info(row)? {
            RowInfo::Header { .. } => None,
            RowInfo::Student { section, offset } => self.buckets[section].get(offset),
        }
    }

    fn student(&self, id: StudentId) -> Option<&Student> {
        let (g, r) = self.locate(id)?;
        self.buckets[g].get(r)
    }

    fn student_mut(&mut self, id: StudentId) -> Option<&mut Student> {
        let (g, r) = self.locate(id)?;
        self.buckets[g].get_mut(r)
    }

    fn index_of(&self, id: StudentId) -> Option<usize> {
        let (g, r) = self.locate(id)?;
        Some(self.absolute_index(g, r))
    }

    fn update(&mut self, student: Student) -> Option<usize> {
        let (g, r) = self.locate(student.id)?;
        self.buckets[g][r] = student;
        Some(self.absolute_index(g, r))
    }

    fn remove_at(&mut self, row: usize) -> Option<Student> {
        match self.row_info(row)? {
            RowInfo::Header { .. } => None,
            RowInfo::Student { section, offset } => Some(self.buckets[section].remove(offset)),
        }
    }

    fn insert(&mut self, student: Student, cmp: Comparator<'_>) -> usize {
        if let Some(row) = self.index_of(student.id) {
            return row;
        }
        let g = bucket_for(&student);
        let bucket = &mut self.buckets[g];
        let pos = bucket.partition_point(|e| cmp(e, &student) != Ordering::Greater);
        bucket.insert(pos, student);
        self.absolute_index(g, pos)
    }

    fn sort(&mut self, cmp: Comparator<'_>) {
        for bucket in self.buckets.iter_mut() {
            bucket.sort_by(|a, b| cmp(a, b));
        }
    }

    fn load(&mut self, students: Vec<Student>, cmp: Comparator<'_>) {
        self.clear();
        for s in students {
            let g = bucket_for(&s);
            if self.buckets[g].iter().any(|e| e.id == s.id) {
                continue;
            }
            self.buckets[g].push(s);
        }
        self.sort(cmp);
    }

    fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
    }

    fn rows_where(&self, pred: &dyn Fn(&Student) -> bool) -> Vec<usize> {
        let mut rows = Vec::new();
        let mut start = 0;
        for bucket in &self.buckets {
            for (r, s) in bucket.iter().enumerate() {
                if pred(s) {
                    rows.push(start + r + 1);
                }
            }
            start += bucket.len() + 1;
        }
        rows
    }
}

use std::cmp::Ordering;

use crate::model::{Student, StudentId};

use super::{Comparator, RosterSource};

/// Plain list view: one sorted vector, row == position.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    students: Vec<Student>,
}

impl FlatIndex {
    pub fn from_students(mut students: Vec<Student>, cmp: Comparator<'_>) -> Self {
        students.sort_by(|a, b| cmp(a, b));
        Self { students }
    }

    pub fn as_slice(&self) -> &[Student] {
        &self.students
    }
}

impl RosterSource for FlatIndex {
    fn row_count(&self) -> usize {
        self.students.len()
    }

    fn flat(&self) -> Vec<Student> {
        self.students.clone()
    }

    fn student_at(&self, row: usize) -> Option<&Student> {
        self.students.get(row)
    }

    fn student(&self, id: StudentId) -> Option<&Student> {
        self.students.iter().find(|s| s.id == id)
    }

    fn student_mut(&mut self, id: StudentId) -> Option<&mut Student> {
        self.students.iter_mut().find(|s| s.id == id)
    }

    fn index_of(&self, id: StudentId) -> Option<usize> {
        self.students.iter().position(|s| s.id == id)
    }

    fn update(&mut self, student: Student) -> Option<usize> {
        let row = self.index_of(student.id)?;
        self.students[row] = student;
        Some(row)
    }

    fn remove_at(&mut self, row: usize) -> Option<Student> {
        (row < self.students.len()).then(|| self.students.remove(row))
    }

    fn insert(&mut self, student: Student, cmp: Comparator<'_>) -> usize {
        if let Some(row) = self.index_of(student.id) {
            return row;
        }
        let pos = self
            .students
            .partition_point(|e| cmp(e, &student) != Ordering::Greater);
        self.students.insert(pos, student);
        pos
    }

    fn sort(&mut self, cmp: Comparator<'_>) {
        self.students.sort_by(|a, b| cmp(a, b));
    }

    fn load(&mut self, students: Vec<Student>, cmp: Comparator<'_>) {
        self.students = students;
        self.sort(cmp);
    }

    fn clear(&mut self) {
        self.students.clear();
    }

    fn rows_where(&self, pred: &dyn Fn(&Student) -> bool) -> Vec<usize> {
        self.students
            .iter()
            .enumerate()
            .filter(|(_, s)| pred(s))
            .map(|(i, _)| i)
            .collect()
    }
}

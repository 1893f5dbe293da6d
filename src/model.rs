use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub type StudentId = i64;

/// Name given to every class row created by a promotion.
pub const DEFAULT_CLASS_NAME: &str = "A";
/// Highest class level; anything past it has graduated.
pub const MAX_LEVEL: u32 = 6;

const LEVEL_PREFIX: &str = "Kelas ";
const GRADUATED_LABEL: &str = "Lulus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StudentStatus {
    Active,
    Withdrawn,
    Graduated,
    Promoted,
}

impl StudentStatus {
    pub fn code(self) -> i64 {
        match self {
            StudentStatus::Active => 1,
            StudentStatus::Withdrawn => 2,
            StudentStatus::Graduated => 3,
            StudentStatus::Promoted => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(StudentStatus::Active),
            2 => Some(StudentStatus::Withdrawn),
            3 => Some(StudentStatus::Graduated),
            4 => Some(StudentStatus::Promoted),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StudentStatus::Active => "Active",
            StudentStatus::Withdrawn => "Withdrawn",
            StudentStatus::Graduated => "Graduated",
            StudentStatus::Promoted => "Promoted",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let t = label.trim();
        [
            StudentStatus::Active,
            StudentStatus::Withdrawn,
            StudentStatus::Graduated,
            StudentStatus::Promoted,
        ]
        .into_iter()
        .find(|s| s.label().eq_ignore_ascii_case(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn code(self) -> i64 {
        match self {
            Gender::Male => 1,
            Gender::Female => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 2 {
            Gender::Female
        } else {
            Gender::Male
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Some(Gender::Male),
            "female" | "f" => Some(Gender::Female),
            _ => None,
        }
    }
}

/// Class a student currently sits in, derived from the latest enrollment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClassLevel {
    Level(u32),
    Graduated,
    Unassigned,
}

impl ClassLevel {
    /// Parses a class label by its numeric suffix ("Kelas 3", "Class 3", "3").
    /// Empty and malformed labels are `Unassigned`.
    pub fn parse(label: &str) -> Self {
        let t = label.trim();
        if t.is_empty() {
            return ClassLevel::Unassigned;
        }
        if t.eq_ignore_ascii_case(GRADUATED_LABEL) || t.eq_ignore_ascii_case("graduated") {
            return ClassLevel::Graduated;
        }
        let digits: String = t
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        match digits.parse::<u32>() {
            Ok(n) => ClassLevel::Level(n),
            Err(_) => ClassLevel::Unassigned,
        }
    }

    pub fn label(self) -> String {
        match self {
            ClassLevel::Level(n) => format!("{LEVEL_PREFIX}{n}"),
            ClassLevel::Graduated => GRADUATED_LABEL.to_string(),
            ClassLevel::Unassigned => String::new(),
        }
    }

    pub fn level(self) -> Option<u32> {
        match self {
            ClassLevel::Level(n) => Some(n),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u32 {
        match self {
            ClassLevel::Level(n) => n,
            ClassLevel::Graduated => 99,
            ClassLevel::Unassigned => 100,
        }
    }
}

impl From<String> for ClassLevel {
    fn from(s: String) -> Self {
        ClassLevel::parse(&s)
    }
}

impl From<ClassLevel> for String {
    fn from(level: ClassLevel) -> Self {
        level.label()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StudentColumn {
    Id,
    Name,
    Address,
    BirthPlaceDate,
    EnrolledOn,
    Guardian,
    Nis,
    Nisn,
    Father,
    Mother,
    Gender,
    Status,
    ClassLevel,
    ExitDate,
    Phone,
}

impl StudentColumn {
    /// Column of the `students` table backing this field. Derived fields have none.
    pub fn storage_column(self) -> Option<&'static str> {
        match self {
            StudentColumn::Name => Some("name"),
            StudentColumn::Address => Some("address"),
            StudentColumn::BirthPlaceDate => Some("birth_place_date"),
            StudentColumn::EnrolledOn => Some("enrolled_on"),
            StudentColumn::Guardian => Some("guardian"),
            StudentColumn::Nis => Some("nis"),
            StudentColumn::Nisn => Some("nisn"),
            StudentColumn::Father => Some("father"),
            StudentColumn::Mother => Some("mother"),
            StudentColumn::Gender => Some("gender"),
            StudentColumn::ExitDate => Some("exit_date"),
            StudentColumn::Phone => Some("phone"),
            StudentColumn::Id | StudentColumn::Status | StudentColumn::ClassLevel => None,
        }
    }

    fn is_date(self) -> bool {
        matches!(self, StudentColumn::EnrolledOn | StudentColumn::ExitDate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub birth_place_date: String,
    #[serde(default)]
    pub enrolled_on: String,
    #[serde(default)]
    pub guardian: String,
    #[serde(default)]
    pub nis: String,
    #[serde(default)]
    pub nisn: String,
    #[serde(default)]
    pub father: String,
    #[serde(default)]
    pub mother: String,
    pub gender: Gender,
    pub status: StudentStatus,
    #[serde(default)]
    pub exit_date: String,
    #[serde(default)]
    pub phone: String,
    pub class_level: ClassLevel,
}

impl Student {
    pub fn new(id: StudentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: String::new(),
            birth_place_date: String::new(),
            enrolled_on: String::new(),
            guardian: String::new(),
            nis: String::new(),
            nisn: String::new(),
            father: String::new(),
            mother: String::new(),
            gender: Gender::Male,
            status: StudentStatus::Active,
            exit_date: String::new(),
            phone: String::new(),
            class_level: ClassLevel::Unassigned,
        }
    }

    pub fn value(&self, column: StudentColumn) -> String {
        match column {
            StudentColumn::Id => self.id.to_string(),
            StudentColumn::Name => self.name.clone(),
            StudentColumn::Address => self.address.clone(),
            StudentColumn::BirthPlaceDate => self.birth_place_date.clone(),
            StudentColumn::EnrolledOn => self.enrolled_on.clone(),
            StudentColumn::Guardian => self.guardian.clone(),
            StudentColumn::Nis => self.nis.clone(),
            StudentColumn::Nisn => self.nisn.clone(),
            StudentColumn::Father => self.father.clone(),
            StudentColumn::Mother => self.mother.clone(),
            StudentColumn::Gender => self.gender.label().to_string(),
            StudentColumn::Status => self.status.label().to_string(),
            StudentColumn::ClassLevel => self.class_level.label(),
            StudentColumn::ExitDate => self.exit_date.clone(),
            StudentColumn::Phone => self.phone.clone(),
        }
    }

    /// Applies a textual value to one field. `Id` is immutable and ignored.
    pub fn set_value(&mut self, column: StudentColumn, value: &str) {
        match column {
            StudentColumn::Id => {}
            StudentColumn::Name => self.name = value.to_string(),
            StudentColumn::Address => self.address = value.to_string(),
            StudentColumn::BirthPlaceDate => self.birth_place_date = value.to_string(),
            StudentColumn::EnrolledOn => self.enrolled_on = value.to_string(),
            StudentColumn::Guardian => self.guardian = value.to_string(),
            StudentColumn::Nis => self.nis = value.to_string(),
            StudentColumn::Nisn => self.nisn = value.to_string(),
            StudentColumn::Father => self.father = value.to_string(),
            StudentColumn::Mother => self.mother = value.to_string(),
            StudentColumn::Gender => self.gender = Gender::from_label(value).unwrap_or(Gender::Male),
            StudentColumn::Status => {
                self.status = StudentStatus::from_label(value).unwrap_or(StudentStatus::Active)
            }
            StudentColumn::ClassLevel => self.class_level = ClassLevel::parse(value),
            StudentColumn::ExitDate => self.exit_date = value.to_string(),
            StudentColumn::Phone => self.phone = value.to_string(),
        }
    }
}

/// Default ordering: name, class level, address, father, mother, id.
pub fn default_order(a: &Student, b: &Student) -> Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| a.class_level.ordinal().cmp(&b.class_level.ordinal()))
        .then_with(|| a.address.cmp(&b.address))
        .then_with(|| a.father.cmp(&b.father))
        .then_with(|| a.mother.cmp(&b.mother))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortDescriptor {
    pub column: StudentColumn,
    pub ascending: bool,
}

impl Default for SortDescriptor {
    fn default() -> Self {
        Self {
            column: StudentColumn::Name,
            ascending: true,
        }
    }
}

impl SortDescriptor {
    /// Total order: the sort column first, `default_order` as tie-break.
    pub fn compare(&self, a: &Student, b: &Student) -> Ordering {
        let primary = match self.column {
            StudentColumn::Id => a.id.cmp(&b.id),
            StudentColumn::ClassLevel => a.class_level.ordinal().cmp(&b.class_level.ordinal()),
            c if c.is_date() => compare_dates(&a.value(c), &b.value(c)),
            c => a.value(c).cmp(&b.value(c)),
        };
        let ord = primary.then_with(|| default_order(a, b));
        if self.ascending {
            ord
        } else {
            ord.reverse()
        }
    }
}

fn compare_dates(a: &str, b: &str) -> Ordering {
    let pa = NaiveDate::parse_from_str(a.trim(), "%Y-%m-%d").ok();
    let pb = NaiveDate::parse_from_str(b.trim(), "%Y-%m-%d").ok();
    match (pa, pb) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Single-field edit, applied backwards by undo and forwards by redo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEdit {
    pub student_id: StudentId,
    pub column: StudentColumn,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivatedEntry {
    pub enrollment_id: i64,
    pub previous_status_code: i64,
    pub previous_exit_date: Option<String>,
}

/// Everything needed to reverse one student's status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionContext {
    pub student_id: StudentId,
    pub deactivated: Vec<DeactivatedEntry>,
    pub new_enrollment_id: Option<i64>,
    pub new_entry_class_id: Option<i64>,
    pub date: String,
    pub year: String,
    pub term: String,
    pub status: StudentStatus,
    pub previous_status: StudentStatus,
    pub previous_exit_date: String,
    pub previous_class: ClassLevel,
    pub current_class: ClassLevel,
}

/// Fields for a student that does not exist yet. The optional level/year/term
/// triple creates the first enrollment row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewStudent {
    pub name: String,
    pub address: String,
    pub birth_place_date: String,
    pub enrolled_on: String,
    pub guardian: String,
    pub nis: String,
    pub nisn: String,
    pub father: String,
    pub mother: String,
    pub gender: Option<Gender>,
    pub phone: String,
    pub level: Option<u32>,
    pub year: Option<String>,
    pub term: Option<String>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StorageError;

pub type StudentId = String;
pub type LessonId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaType {
    ModuleCompletion,
    CourseCompletion,
    Score,
    Engagement,
}

impl CriteriaType {
    pub const ALL: [CriteriaType; 4] = [
        CriteriaType::ModuleCompletion,
        CriteriaType::CourseCompletion,
        CriteriaType::Score,
        CriteriaType::Engagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CriteriaType::ModuleCompletion => "module_completion",
            CriteriaType::CourseCompletion => "course_completion",
            CriteriaType::Score => "score",
            CriteriaType::Engagement => "engagement",
        }
    }
}

impl fmt::Display for CriteriaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CriteriaType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module_completion" => Ok(CriteriaType::ModuleCompletion),
            "course_completion" => Ok(CriteriaType::CourseCompletion),
            "score" => Ok(CriteriaType::Score),
            "engagement" => Ok(CriteriaType::Engagement),
            other => Err(StorageError::InvalidData(format!(
                "unknown criteria type `{other}`"
            ))),
        }
    }
}

/// Catalog entry. Never mutated by student actions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Badge {
    pub id: Uuid,
    pub title: String,
    pub criteria_type: CriteriaType,
    pub points_value: i32,
    pub active: bool,
}

/// Context a badge is granted in. Absent fields take part in the dedup key as null.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BadgeContext {
    pub course_id: Option<Uuid>,
    pub module_identifier: Option<String>,
}

impl BadgeContext {
    pub fn course(course_id: Uuid) -> Self {
        Self {
            course_id: Some(course_id),
            module_identifier: None,
        }
    }

    pub fn module(course_id: Uuid, module_identifier: impl Into<String>) -> Self {
        Self {
            course_id: Some(course_id),
            module_identifier: Some(module_identifier.into()),
        }
    }
}

/// Uniqueness key of the achievement ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BadgeKey {
    pub student_id: StudentId,
    pub badge_id: Uuid,
    pub course_id: Option<Uuid>,
    pub module_identifier: Option<String>,
}

impl BadgeKey {
    pub fn new(student_id: &str, badge_id: Uuid, context: &BadgeContext) -> Self {
        Self {
            student_id: student_id.to_string(),
            badge_id,
            course_id: context.course_id,
            module_identifier: context.module_identifier.clone(),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EarnedBadge {
    pub id: Uuid,
    pub student_id: StudentId,
    pub badge_id: Uuid,
    pub criteria_type: CriteriaType,
    pub course_id: Option<Uuid>,
    pub module_identifier: Option<String>,
    pub earned_at: DateTime<Utc>,
}

impl EarnedBadge {
    pub fn key(&self) -> BadgeKey {
        BadgeKey {
            student_id: self.student_id.clone(),
            badge_id: self.badge_id,
            course_id: self.course_id,
            module_identifier: self.module_identifier.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: StudentId,
    pub course_id: Uuid,
    pub serial_number: String,
    pub issue_date: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: StudentId,
    pub course_id: Uuid,
    pub completed_lesson_ids: BTreeSet<LessonId>,
    pub progress_percent: u8,
    pub completed: bool,
    pub last_accessed_at: DateTime<Utc>,
    pub enrolled_at: DateTime<Utc>,
    /// Bumped on every write; guards read-modify-write cycles.
    pub version: i64,
}

impl Enrollment {
    pub fn new(student_id: &str, course_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            course_id,
            completed_lesson_ids: BTreeSet::new(),
            progress_percent: 0,
            completed: false,
            last_accessed_at: now,
            enrolled_at: now,
            version: 0,
        }
    }

    pub fn status(&self) -> CompletionStatus {
        CompletionStatus::from_percent(self.progress_percent)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl CompletionStatus {
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            0 => CompletionStatus::NotStarted,
            p if p >= 100 => CompletionStatus::Completed,
            _ => CompletionStatus::InProgress,
        }
    }
}

/// Course structure as reported by the course service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CourseOutline {
    pub course_id: Uuid,
    pub title: String,
    pub instructor_id: Option<StudentId>,
    pub modules: Vec<ModuleOutline>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleOutline {
    pub identifier: String,
    pub lesson_ids: Vec<LessonId>,
}

impl CourseOutline {
    pub fn total_lessons(&self) -> usize {
        self.modules.iter().map(|m| m.lesson_ids.len()).sum()
    }

    pub fn contains_lesson(&self, lesson_id: &str) -> bool {
        self.module_of(lesson_id).is_some()
    }

    pub fn module_of(&self, lesson_id: &str) -> Option<&ModuleOutline> {
        self.modules
            .iter()
            .find(|m| m.lesson_ids.iter().any(|l| l == lesson_id))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub completed_lesson_ids: BTreeSet<LessonId>,
    pub progress_percent: u8,
    pub completed: bool,
    pub status: CompletionStatus,
    pub total_lessons: usize,
    pub last_accessed_at: DateTime<Utc>,
}

/// Emitted by the tracker after each successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressChanged {
    pub previous: Enrollment,
    pub current: Enrollment,
    /// Lesson that was toggled, with `true` when it was added to the set.
    pub toggled: Option<(LessonId, bool)>,
}

impl ProgressChanged {
    pub fn crossed_completion(&self) -> bool {
        self.previous.progress_percent < 100 && self.current.progress_percent == 100
    }
}

/// Result of an issuance attempt: freshly written or already on record.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", content = "record", rename_all = "snake_case")]
pub enum Grant<T> {
    Issued(T),
    Existing(T),
}

impl<T> Grant<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Grant::Issued(_))
    }

    pub fn record(&self) -> &T {
        match self {
            Grant::Issued(r) | Grant::Existing(r) => r,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Grant::Issued(r) | Grant::Existing(r) => r,
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Rewards {
    pub certificate: Option<Certificate>,
    pub badges: Vec<EarnedBadge>,
}

impl Rewards {
    pub fn is_empty(&self) -> bool {
        self.certificate.is_none() && self.badges.is_empty()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProgressOutcome {
    pub progress: ProgressView,
    /// Rewards newly issued by this call only.
    pub rewards: Rewards,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GradeEvent {
    pub submission_id: Uuid,
    pub student_id: StudentId,
    pub course_id: Uuid,
    pub grade: f64,
    pub points_possible: f64,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    pub submission_id: Uuid,
    pub ratio: f64,
    pub high_score: bool,
    pub score_badge: Option<Grant<EarnedBadge>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub student_id: StudentId,
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Identity handed over by the auth layer; trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn student(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Student)
    }

    pub fn is(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Instructor | Role::Admin)
    }
}

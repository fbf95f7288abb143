//! Authoritative completion state of each (student, course) enrollment.
//!
//! Every mutation is a read-modify-write guarded by the enrollment's version:
//! a write that lost a race is recomputed from the fresh record and retried,
//! so concurrent toggles never drop each other's lessons.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ProgressError, ProgressResult};
use crate::models::{
    Caller, CourseOutline, Enrollment, LessonId, ProgressChanged, ProgressView, Role,
};
use crate::store::{CourseDirectory, EnrollmentStore, ENROLLMENT_KEY};

const MAX_LESSON_ID_LEN: usize = 128;

/// `round(completed / total * 100)`, clamped to 100. A course without lessons
/// leaves `previous` untouched.
pub fn progress_percent(completed: usize, total: usize, previous: u8) -> u8 {
    if total == 0 {
        return previous;
    }
    let pct = (completed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

pub fn validate_lesson_id(lesson_id: &str) -> ProgressResult<()> {
    if lesson_id.is_empty() {
        return Err(ProgressError::Validation("lesson id is empty".into()));
    }
    if lesson_id.len() > MAX_LESSON_ID_LEN {
        return Err(ProgressError::Validation(format!(
            "lesson id longer than {MAX_LESSON_ID_LEN} bytes"
        )));
    }
    if lesson_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ProgressError::Validation(format!(
            "lesson id {lesson_id:?} contains whitespace or control characters"
        )));
    }
    Ok(())
}

pub struct EnrollmentTracker {
    enrollments: Arc<dyn EnrollmentStore>,
    courses: Arc<dyn CourseDirectory>,
    max_retries: u32,
}

impl EnrollmentTracker {
    pub fn new(
        enrollments: Arc<dyn EnrollmentStore>,
        courses: Arc<dyn CourseDirectory>,
        max_retries: u32,
    ) -> Self {
        Self {
            enrollments,
            courses,
            max_retries: max_retries.max(1),
        }
    }

    /// Creates the enrollment, or returns the one already on record.
    pub async fn enroll(
        &self,
        caller: &Caller,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<Enrollment> {
        if !caller.is(student_id) && caller.role != Role::Admin {
            return Err(ProgressError::Unauthorized(format!(
                "{} cannot enroll {student_id}",
                caller.user_id
            )));
        }
        if self.courses.course_outline(course_id).await?.is_none() {
            return Err(ProgressError::NotFound(format!("course {course_id}")));
        }

        let enrollment = Enrollment::new(student_id, course_id);
        match self.enrollments.insert_enrollment(&enrollment).await {
            Ok(()) => {
                tracing::info!(student_id, %course_id, "student enrolled");
                Ok(enrollment)
            }
            Err(e) if e.is_duplicate_on(ENROLLMENT_KEY) => self.load(student_id, course_id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Adds `lesson_id` to the completed set, or removes it if already there.
    ///
    /// A lesson missing from `outline` can only be removed, and only if the
    /// enrollment still holds it.
    pub async fn toggle_lesson(
        &self,
        caller: &Caller,
        student_id: &str,
        outline: &CourseOutline,
        lesson_id: &str,
    ) -> ProgressResult<ProgressChanged> {
        validate_lesson_id(lesson_id)?;
        let enrollment = self.load(student_id, outline.course_id).await?;
        if !caller.is(&enrollment.student_id) {
            return Err(ProgressError::Unauthorized(format!(
                "{} is not the enrolled student",
                caller.user_id
            )));
        }

        self.update(enrollment, |next| {
            let added = if next.completed_lesson_ids.remove(lesson_id) {
                false
            } else if outline.contains_lesson(lesson_id) {
                next.completed_lesson_ids.insert(lesson_id.to_string());
                true
            } else {
                return Err(ProgressError::Validation(format!(
                    "lesson {lesson_id} is not part of course {}",
                    outline.course_id
                )));
            };
            apply_progress(next, outline);
            Ok(Some((lesson_id.to_string(), added)))
        })
        .await
    }

    /// Re-derives progress against a (possibly changed) course outline.
    pub async fn recompute(
        &self,
        student_id: &str,
        outline: &CourseOutline,
    ) -> ProgressResult<ProgressChanged> {
        let enrollment = self.load(student_id, outline.course_id).await?;
        self.update(enrollment, |next| {
            apply_progress(next, outline);
            Ok(None)
        })
        .await
    }

    pub async fn get_progress(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<ProgressView> {
        let enrollment = self.load(student_id, course_id).await?;
        let total_lessons = self
            .courses
            .course_outline(course_id)
            .await?
            .map(|outline| outline.total_lessons())
            .unwrap_or(0);

        Ok(ProgressView {
            status: enrollment.status(),
            completed_lesson_ids: enrollment.completed_lesson_ids,
            progress_percent: enrollment.progress_percent,
            completed: enrollment.completed,
            total_lessons,
            last_accessed_at: enrollment.last_accessed_at,
        })
    }

    async fn load(&self, student_id: &str, course_id: Uuid) -> ProgressResult<Enrollment> {
        self.enrollments
            .get_enrollment(student_id, course_id)
            .await?
            .ok_or_else(|| {
                ProgressError::NotFound(format!("enrollment of {student_id} in {course_id}"))
            })
    }

    async fn update<F>(&self, mut current: Enrollment, mutate: F) -> ProgressResult<ProgressChanged>
    where
        F: Fn(&mut Enrollment) -> ProgressResult<Option<(LessonId, bool)>> + Send + Sync,
    {
        for attempt in 1..=self.max_retries {
            let mut next = current.clone();
            let toggled = mutate(&mut next)?;
            next.last_accessed_at = Utc::now();
            next.version = current.version + 1;

            if self
                .enrollments
                .compare_and_swap_enrollment(current.version, &next)
                .await?
            {
                tracing::debug!(
                    student_id = %next.student_id,
                    course_id = %next.course_id,
                    progress = next.progress_percent,
                    "progress updated"
                );
                return Ok(ProgressChanged {
                    previous: current,
                    current: next,
                    toggled,
                });
            }

            tracing::debug!(
                attempt,
                student_id = %current.student_id,
                "enrollment changed underneath, retrying"
            );
            current = self.load(&current.student_id, current.course_id).await?;
        }

        Err(ProgressError::Conflict(format!(
            "enrollment of {} in {} kept changing after {} attempts",
            current.student_id, current.course_id, self.max_retries
        )))
    }
}

/// Only lessons still in the outline count; stale ids stay stored so they can
/// be toggled off.
fn apply_progress(enrollment: &mut Enrollment, outline: &CourseOutline) {
    let counted = enrollment
        .completed_lesson_ids
        .iter()
        .filter(|l| outline.contains_lesson(l))
        .count();
    enrollment.progress_percent =
        progress_percent(counted, outline.total_lessons(), enrollment.progress_percent);
    enrollment.completed = enrollment.progress_percent == 100;
}

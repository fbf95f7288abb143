//! Turns progress changes and grades into rewards.
//!
//! Primary state (the enrollment) is written first and its result is what the
//! caller gets back. Reward issuance runs afterwards as a best-effort step:
//! failures are logged and left for the next toggle, grade or recompute to
//! retry, which is safe because every issuance path is idempotent.

use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::BadgeCatalog;
use crate::certificates::CertificateRegistry;
use crate::error::{ProgressError, ProgressResult};
use crate::ledger::AchievementLedger;
use crate::models::{
    BadgeContext, Caller, Certificate, CourseOutline, CriteriaType, EarnedBadge, Enrollment,
    GradeEvent, GradeOutcome, Grant, ProgressChanged, ProgressOutcome, ProgressView, Rewards,
};
use crate::notify::{Notification, NotificationQueue, RelatedEntity, Severity};
use crate::store::CourseDirectory;
use crate::tracker::{validate_lesson_id, EnrollmentTracker};

/// Inclusive lower bound on `grade / points_possible` for the score badge.
pub const HIGH_SCORE_RATIO: f64 = 0.90;

pub struct CompletionOrchestrator {
    tracker: EnrollmentTracker,
    courses: Arc<dyn CourseDirectory>,
    ledger: Arc<AchievementLedger>,
    certificates: CertificateRegistry,
    notifications: NotificationQueue,
}

impl CompletionOrchestrator {
    pub fn new(
        tracker: EnrollmentTracker,
        courses: Arc<dyn CourseDirectory>,
        ledger: Arc<AchievementLedger>,
        certificates: CertificateRegistry,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            tracker,
            courses,
            ledger,
            certificates,
            notifications,
        }
    }

    pub fn catalog(&self) -> &BadgeCatalog {
        self.ledger.catalog()
    }

    pub async fn enroll(
        &self,
        caller: &Caller,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<Enrollment> {
        self.tracker.enroll(caller, student_id, course_id).await
    }

    pub async fn get_progress(
        &self,
        caller: &Caller,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<ProgressView> {
        authorize_read(caller, student_id)?;
        self.tracker.get_progress(student_id, course_id).await
    }

    /// Toggles one lesson and issues whatever rewards the new state earns.
    pub async fn toggle_lesson(
        &self,
        caller: &Caller,
        student_id: &str,
        course_id: Uuid,
        lesson_id: &str,
    ) -> ProgressResult<ProgressOutcome> {
        validate_lesson_id(lesson_id)?;
        let outline = self.outline(course_id).await?;
        let change = self
            .tracker
            .toggle_lesson(caller, student_id, &outline, lesson_id)
            .await?;

        let mut rewards = Rewards::default();
        if let Some((lesson, true)) = &change.toggled {
            if let Some(module) = outline.module_of(lesson) {
                if module
                    .lesson_ids
                    .iter()
                    .all(|l| change.current.completed_lesson_ids.contains(l))
                {
                    self.grant_badge(
                        student_id,
                        CriteriaType::ModuleCompletion,
                        BadgeContext::module(course_id, module.identifier.clone()),
                        &mut rewards,
                    )
                    .await;
                }
            }
        }
        if change.crossed_completion() {
            self.grant_certificate(&outline, student_id, &mut rewards).await;
        }

        Ok(outcome(&outline, change, rewards))
    }

    /// Re-derives progress from the current course outline and re-attempts
    /// every reward the enrollment already qualifies for.
    pub async fn recompute(
        &self,
        caller: &Caller,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<ProgressOutcome> {
        authorize_read(caller, student_id)?;
        let outline = self.outline(course_id).await?;
        let change = self.tracker.recompute(student_id, &outline).await?;

        let mut rewards = Rewards::default();
        for module in &outline.modules {
            let finished = !module.lesson_ids.is_empty()
                && module
                    .lesson_ids
                    .iter()
                    .all(|l| change.current.completed_lesson_ids.contains(l));
            if finished {
                self.grant_badge(
                    student_id,
                    CriteriaType::ModuleCompletion,
                    BadgeContext::module(course_id, module.identifier.clone()),
                    &mut rewards,
                )
                .await;
            }
        }
        if change.current.completed {
            self.grant_certificate(&outline, student_id, &mut rewards).await;
        }

        Ok(outcome(&outline, change, rewards))
    }

    /// Applies a grade from the grading service. High scores earn the score
    /// badge for the submission's course.
    pub async fn record_grade(
        &self,
        caller: &Caller,
        event: &GradeEvent,
    ) -> ProgressResult<GradeOutcome> {
        if !caller.is_staff() {
            return Err(ProgressError::Unauthorized(format!(
                "{} cannot record grades",
                caller.user_id
            )));
        }
        let ratio = grade_ratio(event.grade, event.points_possible)?;
        let high_score = ratio >= HIGH_SCORE_RATIO;

        let mut score_badge = None;
        if high_score {
            let context = BadgeContext::course(event.course_id);
            match self
                .ledger
                .issue_badge(&event.student_id, CriteriaType::Score, &context)
                .await
            {
                Ok(Some(grant)) => {
                    if grant.is_new() {
                        self.announce_badge(grant.record());
                    }
                    score_badge = Some(grant);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    error = %e,
                    student_id = %event.student_id,
                    submission_id = %event.submission_id,
                    "score badge grant failed"
                ),
            }
        }

        Ok(GradeOutcome {
            submission_id: event.submission_id,
            ratio,
            high_score,
            score_badge,
        })
    }

    pub async fn badges_for(
        &self,
        caller: &Caller,
        student_id: &str,
    ) -> ProgressResult<Vec<EarnedBadge>> {
        authorize_read(caller, student_id)?;
        self.ledger.badges_for(student_id).await
    }

    pub async fn certificates_for(
        &self,
        caller: &Caller,
        student_id: &str,
    ) -> ProgressResult<Vec<Certificate>> {
        authorize_read(caller, student_id)?;
        self.certificates.certificates_for(student_id).await
    }

    pub async fn verify_certificate(&self, serial: &str) -> ProgressResult<Certificate> {
        self.certificates.verify(serial).await
    }

    async fn outline(&self, course_id: Uuid) -> ProgressResult<CourseOutline> {
        self.courses
            .course_outline(course_id)
            .await?
            .ok_or_else(|| ProgressError::NotFound(format!("course {course_id}")))
    }

    async fn grant_badge(
        &self,
        student_id: &str,
        criteria: CriteriaType,
        context: BadgeContext,
        rewards: &mut Rewards,
    ) {
        match self.ledger.issue_badge(student_id, criteria, &context).await {
            Ok(Some(Grant::Issued(badge))) => {
                self.announce_badge(&badge);
                rewards.badges.push(badge);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                error = %e,
                student_id,
                %criteria,
                course_id = ?context.course_id,
                "badge grant failed, will retry on next recompute"
            ),
        }
    }

    async fn grant_certificate(
        &self,
        outline: &CourseOutline,
        student_id: &str,
        rewards: &mut Rewards,
    ) {
        let issue = match self
            .certificates
            .issue_certificate(student_id, outline.course_id)
            .await
        {
            Ok(issue) => issue,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    student_id,
                    course_id = %outline.course_id,
                    "certificate issuance failed, will retry on next recompute"
                );
                return;
            }
        };

        if let Grant::Issued(certificate) = issue.certificate {
            self.announce_certificate(outline, &certificate);
            rewards.certificate = Some(certificate);
        }
        if let Some(Grant::Issued(badge)) = issue.badge {
            self.announce_badge(&badge);
            rewards.badges.push(badge);
        }
    }

    fn announce_certificate(&self, outline: &CourseOutline, certificate: &Certificate) {
        let related = Some(RelatedEntity {
            kind: "certificate".into(),
            id: certificate.id,
        });
        self.notifications.enqueue(Notification {
            recipient_id: certificate.student_id.clone(),
            message: format!(
                "Congratulations! You completed {} (certificate {}).",
                outline.title, certificate.serial_number
            ),
            severity: Severity::Success,
            related_entity: related.clone(),
        });
        if let Some(instructor) = &outline.instructor_id {
            self.notifications.enqueue(Notification {
                recipient_id: instructor.clone(),
                message: format!("{} completed {}.", certificate.student_id, outline.title),
                severity: Severity::Info,
                related_entity: related,
            });
        }
    }

    fn announce_badge(&self, badge: &EarnedBadge) {
        let title = self
            .catalog()
            .lookup(badge.criteria_type)
            .map(|b| b.title.as_str())
            .unwrap_or("a new");
        self.notifications.enqueue(Notification {
            recipient_id: badge.student_id.clone(),
            message: format!("You earned the {title} badge."),
            severity: Severity::Success,
            related_entity: Some(RelatedEntity {
                kind: "earned_badge".into(),
                id: badge.id,
            }),
        });
    }
}

fn authorize_read(caller: &Caller, student_id: &str) -> ProgressResult<()> {
    if caller.is(student_id) || caller.is_staff() {
        Ok(())
    } else {
        Err(ProgressError::Unauthorized(format!(
            "{} cannot access records of {student_id}",
            caller.user_id
        )))
    }
}

/// `grade / points_possible`, refusing values a grader could not have produced.
pub fn grade_ratio(grade: f64, points_possible: f64) -> ProgressResult<f64> {
    if !grade.is_finite() || !points_possible.is_finite() {
        return Err(ProgressError::Validation("grade must be a finite number".into()));
    }
    if points_possible <= 0.0 {
        return Err(ProgressError::Validation(
            "points possible must be positive".into(),
        ));
    }
    if grade < 0.0 || grade > points_possible {
        return Err(ProgressError::Validation(format!(
            "grade {grade} outside 0..={points_possible}"
        )));
    }
    Ok(grade / points_possible)
}

fn outcome(outline: &CourseOutline, change: ProgressChanged, rewards: Rewards) -> ProgressOutcome {
    let current = change.current;
    ProgressOutcome {
        progress: ProgressView {
            status: current.status(),
            completed_lesson_ids: current.completed_lesson_ids,
            progress_percent: current.progress_percent,
            completed: current.completed,
            total_lessons: outline.total_lessons(),
            last_accessed_at: current.last_accessed_at,
        },
        rewards,
    }
}

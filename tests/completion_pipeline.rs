use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use rustilms_progress::app::{self, AppState};
use rustilms_progress::catalog::default_badges;
use rustilms_progress::config::Config;
use rustilms_progress::error::{ProgressError, StorageError, StorageResult};
use rustilms_progress::memory::MemoryStore;
use rustilms_progress::models::*;
use rustilms_progress::notify::{Notification, Notifier, NotifyError, Severity};
use rustilms_progress::store::{
    BadgeStore, CertificateStore, CourseDirectory, EnrollmentStore, ProgressStore,
};

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        self.seen.lock().unwrap().push(n.clone());
        Ok(())
    }
}

/// Memory store whose reward inserts can be switched to fail.
struct FlakyStore {
    inner: MemoryStore,
    fail_rewards: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> StorageResult<()> {
        if self.fail_rewards.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("database unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EnrollmentStore for FlakyStore {
    async fn get_enrollment(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        self.inner.get_enrollment(student_id, course_id).await
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StorageResult<()> {
        self.inner.insert_enrollment(enrollment).await
    }

    async fn compare_and_swap_enrollment(
        &self,
        expected_version: i64,
        next: &Enrollment,
    ) -> StorageResult<bool> {
        self.inner
            .compare_and_swap_enrollment(expected_version, next)
            .await
    }
}

#[async_trait]
impl BadgeStore for FlakyStore {
    async fn list_badges(&self) -> StorageResult<Vec<Badge>> {
        self.inner.list_badges().await
    }

    async fn find_earned_badge(&self, key: &BadgeKey) -> StorageResult<Option<EarnedBadge>> {
        self.inner.find_earned_badge(key).await
    }

    async fn insert_earned_badge(&self, badge: &EarnedBadge) -> StorageResult<()> {
        self.check()?;
        self.inner.insert_earned_badge(badge).await
    }

    async fn earned_badges_for(&self, student_id: &str) -> StorageResult<Vec<EarnedBadge>> {
        self.inner.earned_badges_for(student_id).await
    }
}

#[async_trait]
impl CertificateStore for FlakyStore {
    async fn find_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Certificate>> {
        self.inner.find_certificate(student_id, course_id).await
    }

    async fn find_certificate_by_serial(&self, serial: &str) -> StorageResult<Option<Certificate>> {
        self.inner.find_certificate_by_serial(serial).await
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StorageResult<()> {
        self.check()?;
        self.inner.insert_certificate(certificate).await
    }

    async fn certificates_for(&self, student_id: &str) -> StorageResult<Vec<Certificate>> {
        self.inner.certificates_for(student_id).await
    }
}

#[async_trait]
impl CourseDirectory for FlakyStore {
    async fn course_outline(&self, course_id: Uuid) -> StorageResult<Option<CourseOutline>> {
        self.inner.course_outline(course_id).await
    }
}

fn outline(modules: &[(&str, &[&str])]) -> CourseOutline {
    CourseOutline {
        course_id: Uuid::new_v4(),
        title: "Systems Programming".into(),
        instructor_id: Some("instructor-1".into()),
        modules: modules
            .iter()
            .map(|(id, lessons)| ModuleOutline {
                identifier: id.to_string(),
                lesson_ids: lessons.iter().map(|l| l.to_string()).collect(),
            })
            .collect(),
    }
}

fn four_lessons() -> CourseOutline {
    outline(&[("m0", &["0-0", "0-1"]), ("m1", &["1-0", "1-1"])])
}

async fn start<S: ProgressStore + 'static>(
    store: Arc<S>,
) -> (AppState, Arc<RecordingNotifier>, JoinHandle<()>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let (state, worker) = app::build(store, &Config::default(), notifier.clone())
        .await
        .unwrap();
    (state, notifier, worker)
}

async fn memory_with(course: &CourseOutline) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_badges(default_badges()));
    store.put_course(course.clone()).unwrap();
    store
}

fn criteria(badges: &[EarnedBadge]) -> Vec<CriteriaType> {
    let mut kinds: Vec<CriteriaType> = badges.iter().map(|b| b.criteria_type).collect();
    kinds.sort();
    kinds
}

#[tokio::test]
async fn four_lesson_course_completes_once_and_keeps_rewards() {
    let course = four_lessons();
    let (app, _, _) = start(memory_with(&course).await).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();

    app.toggle_lesson(&student, "s1", id, "0-0").await.unwrap();
    app.toggle_lesson(&student, "s1", id, "0-1").await.unwrap();
    let three = app.toggle_lesson(&student, "s1", id, "1-0").await.unwrap();
    assert_eq!(three.progress.progress_percent, 75);
    assert!(!three.progress.completed);
    assert!(three.rewards.certificate.is_none());

    let done = app.toggle_lesson(&student, "s1", id, "1-1").await.unwrap();
    assert_eq!(done.progress.progress_percent, 100);
    assert!(done.progress.completed);
    assert_eq!(done.progress.status, CompletionStatus::Completed);
    let certificate = done.rewards.certificate.clone().expect("certificate issued");
    assert_eq!(
        criteria(&done.rewards.badges),
        [CriteriaType::ModuleCompletion, CriteriaType::CourseCompletion]
    );

    let undone = app.toggle_lesson(&student, "s1", id, "1-1").await.unwrap();
    assert_eq!(undone.progress.progress_percent, 75);
    assert!(!undone.progress.completed);
    assert!(undone.rewards.is_empty());

    let redone = app.toggle_lesson(&student, "s1", id, "1-1").await.unwrap();
    assert!(redone.progress.completed);
    assert!(redone.rewards.is_empty());

    let certs = app.certificates_for(&student, "s1").await.unwrap();
    assert_eq!(certs, vec![certificate]);
    let badges = app.badges_for(&student, "s1").await.unwrap();
    assert_eq!(
        criteria(&badges),
        [
            CriteriaType::ModuleCompletion,
            CriteriaType::ModuleCompletion,
            CriteriaType::CourseCompletion
        ]
    );
}

#[tokio::test]
async fn high_score_earns_one_score_badge() {
    let course = four_lessons();
    let (app, _, _) = start(memory_with(&course).await).await;
    let grader = Caller::new("instructor-1", Role::Instructor);
    let event = GradeEvent {
        submission_id: Uuid::new_v4(),
        student_id: "s1".into(),
        course_id: course.course_id,
        grade: 95.0,
        points_possible: 100.0,
    };

    let first = app.record_grade(&grader, &event).await.unwrap();
    assert!(first.high_score);
    let badge = first.score_badge.expect("score badge");
    assert!(badge.is_new());
    assert_eq!(badge.record().criteria_type, CriteriaType::Score);
    assert_eq!(badge.record().course_id, Some(course.course_id));

    let regrade = app.record_grade(&grader, &event).await.unwrap();
    let again = regrade.score_badge.expect("existing badge returned");
    assert!(!again.is_new());
    assert_eq!(again.record().id, badge.record().id);

    let low = GradeEvent {
        grade: 85.0,
        ..event.clone()
    };
    let outcome = app.record_grade(&grader, &low).await.unwrap();
    assert!(!outcome.high_score);
    assert!(outcome.score_badge.is_none());

    let badges = app.badges_for(&grader, "s1").await.unwrap();
    assert_eq!(badges.len(), 1);

    let err = app
        .record_grade(&Caller::student("s1"), &event)
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::Unauthorized(_)));

    let bad = GradeEvent {
        grade: 120.0,
        ..event
    };
    let err = app.record_grade(&grader, &bad).await.unwrap_err();
    assert!(matches!(err, ProgressError::Validation(_)));
}

#[tokio::test]
async fn failed_issuance_does_not_fail_the_toggle_and_recompute_retries() {
    let course = outline(&[("m0", &["a", "b"])]);
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::with_badges(default_badges()),
        fail_rewards: AtomicBool::new(false),
    });
    store.inner.put_course(course.clone()).unwrap();

    let (app, _, _) = start(store.clone()).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();

    store.fail_rewards.store(true, Ordering::SeqCst);
    app.toggle_lesson(&student, "s1", id, "a").await.unwrap();
    let done = app.toggle_lesson(&student, "s1", id, "b").await.unwrap();
    assert_eq!(done.progress.progress_percent, 100);
    assert!(done.rewards.is_empty());
    assert!(app.certificates_for(&student, "s1").await.unwrap().is_empty());

    let grade = GradeEvent {
        submission_id: Uuid::new_v4(),
        student_id: "s1".into(),
        course_id: id,
        grade: 10.0,
        points_possible: 10.0,
    };
    let graded = app
        .record_grade(&Caller::new("instructor-1", Role::Instructor), &grade)
        .await
        .unwrap();
    assert!(graded.high_score);
    assert!(graded.score_badge.is_none());

    store.fail_rewards.store(false, Ordering::SeqCst);
    let retried = app.recompute(&student, "s1", id).await.unwrap();
    assert_eq!(retried.progress.progress_percent, 100);
    assert!(retried.rewards.certificate.is_some());
    assert_eq!(
        criteria(&retried.rewards.badges),
        [CriteriaType::ModuleCompletion, CriteriaType::CourseCompletion]
    );

    let again = app.recompute(&student, "s1", id).await.unwrap();
    assert!(again.rewards.is_empty());
}

#[tokio::test]
async fn notifications_follow_new_rewards_only() {
    let course = outline(&[("m0", &["a", "b"])]);
    let (app, notifier, worker) = start(memory_with(&course).await).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();

    app.toggle_lesson(&student, "s1", id, "a").await.unwrap();
    app.toggle_lesson(&student, "s1", id, "b").await.unwrap();
    app.toggle_lesson(&student, "s1", id, "b").await.unwrap();
    app.toggle_lesson(&student, "s1", id, "b").await.unwrap();

    drop(app);
    worker.await.unwrap();

    let seen = notifier.seen.lock().unwrap();
    // module badge, certificate (student + instructor), course badge
    assert_eq!(seen.len(), 4);
    let instructor: Vec<&Notification> = seen
        .iter()
        .filter(|n| n.recipient_id == "instructor-1")
        .collect();
    assert_eq!(instructor.len(), 1);
    assert_eq!(instructor[0].severity, Severity::Info);
    assert!(seen
        .iter()
        .filter(|n| n.recipient_id == "s1")
        .all(|n| n.severity == Severity::Success));
}

#[tokio::test]
async fn lessons_outside_the_course_are_rejected_unless_already_completed() {
    let course = outline(&[("m0", &["a", "b", "c"])]);
    let store = memory_with(&course).await;
    let (app, _, _) = start(store.clone()).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();

    let err = app
        .toggle_lesson(&student, "s1", id, "zzz")
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::Validation(_)));

    app.toggle_lesson(&student, "s1", id, "c").await.unwrap();
    let mut reshaped = course.clone();
    reshaped.modules[0].lesson_ids.retain(|l| l != "c");
    store.put_course(reshaped).unwrap();

    let removed = app.toggle_lesson(&student, "s1", id, "c").await.unwrap();
    assert!(removed.progress.completed_lesson_ids.is_empty());
    assert_eq!(removed.progress.progress_percent, 0);
    assert_eq!(removed.progress.total_lessons, 2);
}

#[tokio::test]
async fn recompute_follows_course_growth_without_revoking() {
    let course = outline(&[("m0", &["a", "b"])]);
    let store = memory_with(&course).await;
    let (app, _, _) = start(store.clone()).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();
    app.toggle_lesson(&student, "s1", id, "a").await.unwrap();
    let done = app.toggle_lesson(&student, "s1", id, "b").await.unwrap();
    let serial = done.rewards.certificate.unwrap().serial_number;

    let mut grown = course.clone();
    grown.modules.push(ModuleOutline {
        identifier: "m1".into(),
        lesson_ids: vec!["c".into()],
    });
    store.put_course(grown).unwrap();

    let recomputed = app
        .recompute(&Caller::new("instructor-1", Role::Instructor), "s1", id)
        .await
        .unwrap();
    assert_eq!(recomputed.progress.progress_percent, 67);
    assert!(!recomputed.progress.completed);
    assert_eq!(recomputed.progress.status, CompletionStatus::InProgress);

    let cert = app.verify_certificate(&serial).await.unwrap();
    assert_eq!(cert.student_id, "s1");
}

#[tokio::test]
async fn recompute_after_course_shrinks_does_not_certify_unfinished_lessons() {
    let course = outline(&[("m0", &["a", "b", "c"])]);
    let store = memory_with(&course).await;
    let (app, _, _) = start(store.clone()).await;
    let student = Caller::student("s1");
    let id = course.course_id;
    app.enroll(&student, "s1", id).await.unwrap();
    app.toggle_lesson(&student, "s1", id, "a").await.unwrap();
    app.toggle_lesson(&student, "s1", id, "c").await.unwrap();

    let mut shrunk = course.clone();
    shrunk.modules[0].lesson_ids.retain(|l| l != "c");
    store.put_course(shrunk).unwrap();

    let recomputed = app.recompute(&student, "s1", id).await.unwrap();
    assert_eq!(recomputed.progress.progress_percent, 50);
    assert!(!recomputed.progress.completed);
    assert!(recomputed.rewards.is_empty());
    assert!(app.certificates_for(&student, "s1").await.unwrap().is_empty());

    let err = app
        .toggle_lesson(&Caller::student("s2"), "s1", id, "c")
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::Unauthorized(_)));

    let done = app.toggle_lesson(&student, "s1", id, "b").await.unwrap();
    assert!(done.progress.completed);
    assert!(done.rewards.certificate.is_some());
}

#[tokio::test]
async fn progress_reads_are_limited_to_student_and_staff() {
    let course = four_lessons();
    let (app, _, _) = start(memory_with(&course).await).await;
    let id = course.course_id;
    app.enroll(&Caller::student("s1"), "s1", id).await.unwrap();

    let view = app
        .get_progress(&Caller::new("admin", Role::Admin), "s1", id)
        .await
        .unwrap();
    assert_eq!(view.total_lessons, 4);
    assert_eq!(view.status, CompletionStatus::NotStarted);

    let err = app
        .get_progress(&Caller::student("s2"), "s1", id)
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::Unauthorized(_)));
}

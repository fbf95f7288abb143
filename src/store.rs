//! Storage contracts for the progress pipeline.
//!
//! Uniqueness is owned by the backend: every insert that would break one of
//! the keys below fails with [`StorageError::Duplicate`] naming the key, and
//! callers decide whether that means "already done" or "try again".
//!
//! [`StorageError::Duplicate`]: crate::error::StorageError::Duplicate

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::{Badge, BadgeKey, Certificate, CourseOutline, EarnedBadge, Enrollment};

pub const ENROLLMENT_KEY: &str = "enrollments_student_course_key";
pub const EARNED_BADGE_KEY: &str = "earned_badges_context_key";
pub const CERTIFICATE_KEY: &str = "certificates_student_course_key";
pub const CERTIFICATE_SERIAL_KEY: &str = "certificates_serial_number_key";

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn get_enrollment(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Enrollment>>;

    /// Fails with a duplicate on [`ENROLLMENT_KEY`] when the pair is already enrolled.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StorageResult<()>;

    /// Replaces the stored record with `next` only if its version is still
    /// `expected_version`. Returns `false` when another writer got there first.
    async fn compare_and_swap_enrollment(
        &self,
        expected_version: i64,
        next: &Enrollment,
    ) -> StorageResult<bool>;
}

#[async_trait]
pub trait BadgeStore: Send + Sync {
    async fn list_badges(&self) -> StorageResult<Vec<Badge>>;

    async fn find_earned_badge(&self, key: &BadgeKey) -> StorageResult<Option<EarnedBadge>>;

    /// Fails with a duplicate on [`EARNED_BADGE_KEY`] when the key is taken.
    async fn insert_earned_badge(&self, badge: &EarnedBadge) -> StorageResult<()>;

    /// Newest first.
    async fn earned_badges_for(&self, student_id: &str) -> StorageResult<Vec<EarnedBadge>>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Certificate>>;

    async fn find_certificate_by_serial(&self, serial: &str) -> StorageResult<Option<Certificate>>;

    /// Fails with a duplicate on [`CERTIFICATE_KEY`] or [`CERTIFICATE_SERIAL_KEY`].
    async fn insert_certificate(&self, certificate: &Certificate) -> StorageResult<()>;

    /// Newest first.
    async fn certificates_for(&self, student_id: &str) -> StorageResult<Vec<Certificate>>;
}

/// Read side of the course service.
#[async_trait]
pub trait CourseDirectory: Send + Sync {
    async fn course_outline(&self, course_id: Uuid) -> StorageResult<Option<CourseOutline>>;
}

/// A backend that can serve every part of the pipeline.
pub trait ProgressStore: EnrollmentStore + BadgeStore + CertificateStore + CourseDirectory {}

impl<T> ProgressStore for T where T: EnrollmentStore + BadgeStore + CertificateStore + CourseDirectory
{}

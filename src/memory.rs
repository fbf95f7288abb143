//! In-memory backend. Enforces the same unique keys as the Postgres schema,
//! which makes it usable both in tests and for a database-less dev server.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{Badge, BadgeKey, Certificate, CourseOutline, EarnedBadge, Enrollment};
use crate::store::{
    BadgeStore, CertificateStore, CourseDirectory, EnrollmentStore, CERTIFICATE_KEY,
    CERTIFICATE_SERIAL_KEY, EARNED_BADGE_KEY, ENROLLMENT_KEY,
};

#[derive(Default)]
pub struct MemoryStore {
    courses: RwLock<HashMap<Uuid, CourseOutline>>,
    enrollments: RwLock<HashMap<(String, Uuid), Enrollment>>,
    badges: RwLock<Vec<Badge>>,
    earned: RwLock<HashMap<BadgeKey, EarnedBadge>>,
    certificates: RwLock<HashMap<(String, Uuid), Certificate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with the given badge catalog.
    pub fn with_badges(badges: Vec<Badge>) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.badges.write() {
            *guard = badges;
        }
        store
    }

    /// Registers or replaces a course outline.
    pub fn put_course(&self, outline: CourseOutline) -> StorageResult<()> {
        write(&self.courses, "courses")?.insert(outline.course_id, outline);
        Ok(())
    }
}

fn read<'a, T>(lock: &'a RwLock<T>, name: &str) -> StorageResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| StorageError::Connection(format!("{name} lock poisoned")))
}

fn write<'a, T>(lock: &'a RwLock<T>, name: &str) -> StorageResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| StorageError::Connection(format!("{name} lock poisoned")))
}

fn duplicate(constraint: &str) -> StorageError {
    StorageError::Duplicate {
        constraint: constraint.to_string(),
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn get_enrollment(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        let guard = read(&self.enrollments, "enrollments")?;
        Ok(guard.get(&(student_id.to_string(), course_id)).cloned())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StorageResult<()> {
        let mut guard = write(&self.enrollments, "enrollments")?;
        let key = (enrollment.student_id.clone(), enrollment.course_id);
        if guard.contains_key(&key) {
            return Err(duplicate(ENROLLMENT_KEY));
        }
        guard.insert(key, enrollment.clone());
        Ok(())
    }

    async fn compare_and_swap_enrollment(
        &self,
        expected_version: i64,
        next: &Enrollment,
    ) -> StorageResult<bool> {
        let mut guard = write(&self.enrollments, "enrollments")?;
        let key = (next.student_id.clone(), next.course_id);
        let current = guard.get_mut(&key).ok_or_else(|| {
            StorageError::NotFound(format!(
                "enrollment for {} in {}",
                next.student_id, next.course_id
            ))
        })?;
        if current.version != expected_version {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }
}

#[async_trait]
impl BadgeStore for MemoryStore {
    async fn list_badges(&self) -> StorageResult<Vec<Badge>> {
        Ok(read(&self.badges, "badges")?.clone())
    }

    async fn find_earned_badge(&self, key: &BadgeKey) -> StorageResult<Option<EarnedBadge>> {
        Ok(read(&self.earned, "earned_badges")?.get(key).cloned())
    }

    async fn insert_earned_badge(&self, badge: &EarnedBadge) -> StorageResult<()> {
        let mut guard = write(&self.earned, "earned_badges")?;
        let key = badge.key();
        if guard.contains_key(&key) {
            return Err(duplicate(EARNED_BADGE_KEY));
        }
        guard.insert(key, badge.clone());
        Ok(())
    }

    async fn earned_badges_for(&self, student_id: &str) -> StorageResult<Vec<EarnedBadge>> {
        let guard = read(&self.earned, "earned_badges")?;
        let mut badges: Vec<EarnedBadge> = guard
            .values()
            .filter(|b| b.student_id == student_id)
            .cloned()
            .collect();
        badges.sort_by(|a, b| b.earned_at.cmp(&a.earned_at));
        Ok(badges)
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn find_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Certificate>> {
        let guard = read(&self.certificates, "certificates")?;
        Ok(guard.get(&(student_id.to_string(), course_id)).cloned())
    }

    async fn find_certificate_by_serial(&self, serial: &str) -> StorageResult<Option<Certificate>> {
        let guard = read(&self.certificates, "certificates")?;
        Ok(guard.values().find(|c| c.serial_number == serial).cloned())
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StorageResult<()> {
        let mut guard = write(&self.certificates, "certificates")?;
        let key = (certificate.student_id.clone(), certificate.course_id);
        if guard.contains_key(&key) {
            return Err(duplicate(CERTIFICATE_KEY));
        }
        if guard
            .values()
            .any(|c| c.serial_number == certificate.serial_number)
        {
            return Err(duplicate(CERTIFICATE_SERIAL_KEY));
        }
        guard.insert(key, certificate.clone());
        Ok(())
    }

    async fn certificates_for(&self, student_id: &str) -> StorageResult<Vec<Certificate>> {
        let guard = read(&self.certificates, "certificates")?;
        let mut certs: Vec<Certificate> = guard
            .values()
            .filter(|c| c.student_id == student_id)
            .cloned()
            .collect();
        certs.sort_by(|a, b| b.issue_date.cmp(&a.issue_date));
        Ok(certs)
    }
}

#[async_trait]
impl CourseDirectory for MemoryStore {
    async fn course_outline(&self, course_id: Uuid) -> StorageResult<Option<CourseOutline>> {
        Ok(read(&self.courses, "courses")?.get(&course_id).cloned())
    }
}

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ProgressError, ProgressResult, StorageError};
use crate::ledger::AchievementLedger;
use crate::models::{BadgeContext, Certificate, CriteriaType, EarnedBadge, Grant};
use crate::store::{CertificateStore, CERTIFICATE_KEY, CERTIFICATE_SERIAL_KEY};

pub type SerialSource = Arc<dyn Fn() -> String + Send + Sync>;

/// `CERT-` followed by four groups of random uppercase hex.
pub fn random_serial() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!(
        "CERT-{}-{}-{}-{}",
        &hex[0..4],
        &hex[4..8],
        &hex[8..12],
        &hex[12..16]
    )
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CertificateIssue {
    pub certificate: Grant<Certificate>,
    /// `None` when the catalog has no course badge or the grant failed.
    pub badge: Option<Grant<EarnedBadge>>,
}

/// One certificate per (student, course), plus the course-completion badge
/// that goes with it.
pub struct CertificateRegistry {
    store: Arc<dyn CertificateStore>,
    ledger: Arc<AchievementLedger>,
    serials: SerialSource,
    serial_attempts: u32,
}

impl CertificateRegistry {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        ledger: Arc<AchievementLedger>,
        serial_attempts: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            serials: Arc::new(random_serial),
            serial_attempts: serial_attempts.max(1),
        }
    }

    pub fn with_serial_source(mut self, serials: SerialSource) -> Self {
        self.serials = serials;
        self
    }

    /// Idempotent: every call for the same pair yields the same serial.
    ///
    /// The course badge is attempted on every call, so a grant that failed
    /// earlier is retried the next time the certificate is requested.
    pub async fn issue_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<CertificateIssue> {
        let certificate = self.certificate_for(student_id, course_id).await?;

        let badge = match self
            .ledger
            .issue_badge(
                student_id,
                CriteriaType::CourseCompletion,
                &BadgeContext::course(course_id),
            )
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    student_id,
                    %course_id,
                    "course badge grant failed, will retry on next recompute"
                );
                None
            }
        };

        Ok(CertificateIssue { certificate, badge })
    }

    async fn certificate_for(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> ProgressResult<Grant<Certificate>> {
        if let Some(existing) = self.store.find_certificate(student_id, course_id).await? {
            return Ok(Grant::Existing(existing));
        }

        for attempt in 1..=self.serial_attempts {
            let certificate = Certificate {
                id: Uuid::new_v4(),
                student_id: student_id.to_string(),
                course_id,
                serial_number: (self.serials)(),
                issue_date: Utc::now(),
            };

            match self.store.insert_certificate(&certificate).await {
                Ok(()) => {
                    tracing::info!(
                        student_id,
                        %course_id,
                        serial = %certificate.serial_number,
                        "certificate issued"
                    );
                    return Ok(Grant::Issued(certificate));
                }
                Err(e) if e.is_duplicate_on(CERTIFICATE_KEY) => {
                    let existing = self
                        .store
                        .find_certificate(student_id, course_id)
                        .await?
                        .ok_or_else(|| {
                            StorageError::InvalidData(format!(
                                "duplicate certificate for {student_id} in {course_id} reported but not readable"
                            ))
                        })?;
                    return Ok(Grant::Existing(existing));
                }
                Err(e) if e.is_duplicate_on(CERTIFICATE_SERIAL_KEY) => {
                    tracing::warn!(attempt, student_id, %course_id, "certificate serial collision");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProgressError::Conflict(format!(
            "no unique certificate serial after {} attempts",
            self.serial_attempts
        )))
    }

    pub async fn certificates_for(&self, student_id: &str) -> ProgressResult<Vec<Certificate>> {
        Ok(self.store.certificates_for(student_id).await?)
    }

    pub async fn verify(&self, serial: &str) -> ProgressResult<Certificate> {
        self.store
            .find_certificate_by_serial(serial)
            .await?
            .ok_or_else(|| ProgressError::NotFound(format!("certificate {serial}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_badges, BadgeCatalog};
    use crate::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(store: Arc<MemoryStore>) -> CertificateRegistry {
        let catalog = Arc::new(BadgeCatalog::new(default_badges()).unwrap());
        let ledger = Arc::new(AchievementLedger::new(catalog, store.clone()));
        CertificateRegistry::new(store, ledger, 3)
    }

    /// Yields the given serials in order, then repeats the last one.
    fn scripted(serials: &'static [&'static str]) -> SerialSource {
        let next = AtomicUsize::new(0);
        Arc::new(move || {
            let i = next.fetch_add(1, Ordering::SeqCst).min(serials.len() - 1);
            serials[i].to_string()
        })
    }

    #[tokio::test]
    async fn second_issue_returns_same_serial() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let course = Uuid::new_v4();

        let first = registry.issue_certificate("s1", course).await.unwrap();
        let second = registry.issue_certificate("s1", course).await.unwrap();

        assert!(first.certificate.is_new());
        assert!(!second.certificate.is_new());
        assert_eq!(
            first.certificate.record().serial_number,
            second.certificate.record().serial_number
        );
        assert!(first.badge.as_ref().unwrap().is_new());
        assert!(!second.badge.as_ref().unwrap().is_new());
        assert_eq!(store.certificates_for("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn serial_collision_retries_with_a_fresh_token() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store).with_serial_source(scripted(&[
            "CERT-TAKEN",
            "CERT-TAKEN",
            "CERT-FRESH",
        ]));

        registry.issue_certificate("s0", Uuid::new_v4()).await.unwrap();
        let issue = registry.issue_certificate("s1", Uuid::new_v4()).await.unwrap();

        assert_eq!(issue.certificate.record().serial_number, "CERT-FRESH");
    }

    #[tokio::test]
    async fn exhausted_serial_attempts_is_a_conflict() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store).with_serial_source(scripted(&["CERT-SAME"]));

        registry.issue_certificate("s0", Uuid::new_v4()).await.unwrap();
        let err = registry
            .issue_certificate("s1", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::Conflict(_)));
    }

    #[tokio::test]
    async fn verify_finds_certificate_by_serial() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store);
        let issue = registry.issue_certificate("s1", Uuid::new_v4()).await.unwrap();
        let serial = issue.certificate.record().serial_number.clone();

        assert_eq!(registry.verify(&serial).await.unwrap().student_id, "s1");
        assert!(matches!(
            registry.verify("CERT-NOPE").await,
            Err(ProgressError::NotFound(_))
        ));
    }

    #[test]
    fn random_serials_have_the_expected_shape() {
        let serial = random_serial();
        assert_eq!(serial.len(), "CERT-".len() + 19);
        assert!(serial.starts_with("CERT-"));
        assert_ne!(serial, random_serial());
    }
}

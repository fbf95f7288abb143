use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::BadgeCatalog;
use crate::error::{ProgressError, ProgressResult, StorageError};
use crate::models::{BadgeContext, BadgeKey, CriteriaType, EarnedBadge, Grant};
use crate::store::{BadgeStore, EARNED_BADGE_KEY};

/// Grants catalog badges at most once per (student, badge, context).
pub struct AchievementLedger {
    catalog: Arc<BadgeCatalog>,
    store: Arc<dyn BadgeStore>,
}

impl AchievementLedger {
    pub fn new(catalog: Arc<BadgeCatalog>, store: Arc<dyn BadgeStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &BadgeCatalog {
        &self.catalog
    }

    /// Returns `None` when the catalog has no active badge for `criteria`.
    ///
    /// Safe to call repeatedly and concurrently: the storage unique key decides
    /// the winner, and a losing insert re-reads and returns the winner's row.
    pub async fn issue_badge(
        &self,
        student_id: &str,
        criteria: CriteriaType,
        context: &BadgeContext,
    ) -> ProgressResult<Option<Grant<EarnedBadge>>> {
        // an empty identifier would collide with the module-less key
        if context.module_identifier.as_deref() == Some("") {
            return Err(ProgressError::Validation("module identifier is empty".into()));
        }
        let Some(badge) = self.catalog.lookup(criteria) else {
            tracing::debug!(%criteria, "no active badge configured");
            return Ok(None);
        };

        let key = BadgeKey::new(student_id, badge.id, context);
        if let Some(existing) = self.store.find_earned_badge(&key).await? {
            return Ok(Some(Grant::Existing(existing)));
        }

        let earned = EarnedBadge {
            id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            badge_id: badge.id,
            criteria_type: criteria,
            course_id: context.course_id,
            module_identifier: context.module_identifier.clone(),
            earned_at: Utc::now(),
        };

        match self.store.insert_earned_badge(&earned).await {
            Ok(()) => {
                tracing::info!(
                    student_id,
                    badge = %badge.title,
                    %criteria,
                    course_id = ?context.course_id,
                    module = ?context.module_identifier,
                    "badge issued"
                );
                Ok(Some(Grant::Issued(earned)))
            }
            Err(e) if e.is_duplicate_on(EARNED_BADGE_KEY) => {
                tracing::debug!(student_id, %criteria, "badge issued concurrently, re-reading");
                let existing = self.store.find_earned_badge(&key).await?.ok_or_else(|| {
                    StorageError::InvalidData(format!(
                        "duplicate badge grant for {student_id} reported but not readable"
                    ))
                })?;
                Ok(Some(Grant::Existing(existing)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn badges_for(&self, student_id: &str) -> ProgressResult<Vec<EarnedBadge>> {
        Ok(self.store.earned_badges_for(student_id).await?)
    }
}

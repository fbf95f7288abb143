use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ProgressError, ProgressResult};
use crate::models::{Badge, CriteriaType};

/// Active badge per criteria type. Inactive entries are kept out of lookup
/// entirely, and two active badges for one criteria type are refused.
#[derive(Debug, Clone, Default)]
pub struct BadgeCatalog {
    by_criteria: HashMap<CriteriaType, Badge>,
}

impl BadgeCatalog {
    pub fn new(badges: impl IntoIterator<Item = Badge>) -> ProgressResult<Self> {
        let mut by_criteria: HashMap<CriteriaType, Badge> = HashMap::new();
        for badge in badges.into_iter().filter(|b| b.active) {
            if let Some(existing) = by_criteria.get(&badge.criteria_type) {
                return Err(ProgressError::Conflict(format!(
                    "badges `{}` and `{}` are both active for {}",
                    existing.title, badge.title, badge.criteria_type
                )));
            }
            by_criteria.insert(badge.criteria_type, badge);
        }
        Ok(Self { by_criteria })
    }

    pub fn lookup(&self, criteria: CriteriaType) -> Option<&Badge> {
        self.by_criteria.get(&criteria)
    }

    pub fn len(&self) -> usize {
        self.by_criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_criteria.is_empty()
    }
}

/// Seed catalog; ids match the rows inserted by the initial migration.
pub fn default_badges() -> Vec<Badge> {
    let seed = [
        ("7a1f4a52-2f0e-4c55-9a55-3c1f0d7b0a01", "Module Master", CriteriaType::ModuleCompletion, 50),
        ("7a1f4a52-2f0e-4c55-9a55-3c1f0d7b0a02", "Course Graduate", CriteriaType::CourseCompletion, 200),
        ("7a1f4a52-2f0e-4c55-9a55-3c1f0d7b0a03", "High Achiever", CriteriaType::Score, 100),
        ("7a1f4a52-2f0e-4c55-9a55-3c1f0d7b0a04", "Active Learner", CriteriaType::Engagement, 25),
    ];
    seed.into_iter()
        .filter_map(|(id, title, criteria_type, points_value)| {
            Some(Badge {
                id: Uuid::parse_str(id).ok()?,
                title: title.to_string(),
                criteria_type,
                points_value,
                active: true,
            })
        })
        .collect()
}

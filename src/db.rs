use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{
    Badge, BadgeKey, Certificate, CourseOutline, CriteriaType, EarnedBadge, Enrollment,
    ModuleOutline,
};
use crate::store::{BadgeStore, CertificateStore, CourseDirectory, EnrollmentStore};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max_connections: u32) -> StorageResult<Db> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))
}

/// Postgres backend. Unique keys live in the schema (see `migrations/`).
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

fn map_sqlx(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        // unique_violation
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Duplicate {
                constraint: db_err.constraint().unwrap_or_default().to_string(),
            };
        }
    }
    StorageError::Query(err.to_string())
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    student_id: String,
    course_id: Uuid,
    completed_lesson_ids: Vec<String>,
    progress_percent: i16,
    completed: bool,
    last_accessed_at: DateTime<Utc>,
    enrolled_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StorageError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        let progress_percent = u8::try_from(row.progress_percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                StorageError::InvalidData(format!(
                    "enrollment {} has progress {}",
                    row.id, row.progress_percent
                ))
            })?;
        Ok(Enrollment {
            id: row.id,
            student_id: row.student_id,
            course_id: row.course_id,
            completed_lesson_ids: row.completed_lesson_ids.into_iter().collect::<BTreeSet<_>>(),
            progress_percent,
            completed: row.completed,
            last_accessed_at: row.last_accessed_at,
            enrolled_at: row.enrolled_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BadgeRow {
    id: Uuid,
    title: String,
    criteria_type: String,
    points_value: i32,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct EarnedBadgeRow {
    id: Uuid,
    student_id: String,
    badge_id: Uuid,
    criteria_type: String,
    course_id: Option<Uuid>,
    module_identifier: Option<String>,
    earned_at: DateTime<Utc>,
}

impl TryFrom<EarnedBadgeRow> for EarnedBadge {
    type Error = StorageError;

    fn try_from(row: EarnedBadgeRow) -> Result<Self, Self::Error> {
        Ok(EarnedBadge {
            id: row.id,
            student_id: row.student_id,
            badge_id: row.badge_id,
            criteria_type: row.criteria_type.parse::<CriteriaType>()?,
            course_id: row.course_id,
            module_identifier: row.module_identifier,
            earned_at: row.earned_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    student_id: String,
    course_id: Uuid,
    serial_number: String,
    issue_date: DateTime<Utc>,
}

impl From<CertificateRow> for Certificate {
    fn from(row: CertificateRow) -> Self {
        Certificate {
            id: row.id,
            student_id: row.student_id,
            course_id: row.course_id,
            serial_number: row.serial_number,
            issue_date: row.issue_date,
        }
    }
}

const EARNED_BADGE_SELECT: &str = r#"
    SELECT e.id, e.student_id, e.badge_id, b.criteria_type, e.course_id,
           e.module_identifier, e.earned_at
    FROM earned_badges e
    JOIN badges b ON b.id = e.badge_id
"#;

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn get_enrollment(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        let row = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            SELECT id, student_id, course_id, completed_lesson_ids, progress_percent,
                   completed, last_accessed_at, enrolled_at, version
            FROM enrollments
            WHERE student_id = $1 AND course_id = $2
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(Enrollment::try_from).transpose()
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StorageResult<()> {
        let lessons: Vec<String> = enrollment.completed_lesson_ids.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO enrollments (id, student_id, course_id, completed_lesson_ids,
                progress_percent, completed, last_accessed_at, enrolled_at, version)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(enrollment.id)
        .bind(&enrollment.student_id)
        .bind(enrollment.course_id)
        .bind(lessons)
        .bind(i16::from(enrollment.progress_percent))
        .bind(enrollment.completed)
        .bind(enrollment.last_accessed_at)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn compare_and_swap_enrollment(
        &self,
        expected_version: i64,
        next: &Enrollment,
    ) -> StorageResult<bool> {
        let lessons: Vec<String> = next.completed_lesson_ids.iter().cloned().collect();
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET completed_lesson_ids = $1, progress_percent = $2, completed = $3,
                last_accessed_at = $4, version = $5
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(lessons)
        .bind(i16::from(next.progress_percent))
        .bind(next.completed)
        .bind(next.last_accessed_at)
        .bind(next.version)
        .bind(next.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl BadgeStore for PgStore {
    async fn list_badges(&self) -> StorageResult<Vec<Badge>> {
        let rows = sqlx::query_as::<_, BadgeRow>(
            "SELECT id, title, criteria_type, points_value, active FROM badges ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter()
            .map(|r| -> StorageResult<Badge> {
                Ok(Badge {
                    id: r.id,
                    title: r.title,
                    criteria_type: r.criteria_type.parse()?,
                    points_value: r.points_value,
                    active: r.active,
                })
            })
            .collect()
    }

    async fn find_earned_badge(&self, key: &BadgeKey) -> StorageResult<Option<EarnedBadge>> {
        let sql = format!(
            "{EARNED_BADGE_SELECT}
            WHERE e.student_id = $1 AND e.badge_id = $2
              AND COALESCE(e.course_id, '00000000-0000-0000-0000-000000000000'::uuid)
                = COALESCE($3, '00000000-0000-0000-0000-000000000000'::uuid)
              AND COALESCE(e.module_identifier, '') = COALESCE($4, '')"
        );
        let row = sqlx::query_as::<_, EarnedBadgeRow>(&sql)
            .bind(&key.student_id)
            .bind(key.badge_id)
            .bind(key.course_id)
            .bind(key.module_identifier.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.map(EarnedBadge::try_from).transpose()
    }

    async fn insert_earned_badge(&self, badge: &EarnedBadge) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO earned_badges (id, student_id, badge_id, course_id, module_identifier, earned_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            "#,
        )
        .bind(badge.id)
        .bind(&badge.student_id)
        .bind(badge.badge_id)
        .bind(badge.course_id)
        .bind(badge.module_identifier.as_deref())
        .bind(badge.earned_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn earned_badges_for(&self, student_id: &str) -> StorageResult<Vec<EarnedBadge>> {
        let sql = format!("{EARNED_BADGE_SELECT} WHERE e.student_id = $1 ORDER BY e.earned_at DESC");
        let rows = sqlx::query_as::<_, EarnedBadgeRow>(&sql)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.into_iter().map(EarnedBadge::try_from).collect()
    }
}

#[async_trait]
impl CertificateStore for PgStore {
    async fn find_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StorageResult<Option<Certificate>> {
        let row = sqlx::query_as::<_, CertificateRow>(
            r#"
            SELECT id, student_id, course_id, serial_number, issue_date
            FROM certificates WHERE student_id = $1 AND course_id = $2
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(Certificate::from))
    }

    async fn find_certificate_by_serial(&self, serial: &str) -> StorageResult<Option<Certificate>> {
        let row = sqlx::query_as::<_, CertificateRow>(
            r#"
            SELECT id, student_id, course_id, serial_number, issue_date
            FROM certificates WHERE serial_number = $1
            "#,
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(Certificate::from))
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO certificates (id, student_id, course_id, serial_number, issue_date)
            VALUES ($1,$2,$3,$4,$5)
            "#,
        )
        .bind(certificate.id)
        .bind(&certificate.student_id)
        .bind(certificate.course_id)
        .bind(&certificate.serial_number)
        .bind(certificate.issue_date)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn certificates_for(&self, student_id: &str) -> StorageResult<Vec<Certificate>> {
        let rows = sqlx::query_as::<_, CertificateRow>(
            r#"
            SELECT id, student_id, course_id, serial_number, issue_date
            FROM certificates WHERE student_id = $1 ORDER BY issue_date DESC
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows.into_iter().map(Certificate::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    title: String,
    instructor_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct LessonRow {
    module_identifier: String,
    id: String,
}

#[async_trait]
impl CourseDirectory for PgStore {
    async fn course_outline(&self, course_id: Uuid) -> StorageResult<Option<CourseOutline>> {
        let Some(course) = sqlx::query_as::<_, CourseRow>(
            "SELECT title, instructor_id FROM courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        else {
            return Ok(None);
        };

        let module_ids: Vec<String> = sqlx::query_scalar(
            "SELECT identifier FROM course_modules WHERE course_id = $1 ORDER BY position",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let lessons = sqlx::query_as::<_, LessonRow>(
            "SELECT module_identifier, id FROM lessons WHERE course_id = $1 ORDER BY position",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let modules = module_ids
            .into_iter()
            .map(|identifier| {
                let lesson_ids = lessons
                    .iter()
                    .filter(|l| l.module_identifier == identifier)
                    .map(|l| l.id.clone())
                    .collect();
                ModuleOutline {
                    identifier,
                    lesson_ids,
                }
            })
            .collect();

        Ok(Some(CourseOutline {
            course_id,
            title: course.title,
            instructor_id: course.instructor_id,
            modules,
        }))
    }
}

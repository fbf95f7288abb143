use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    routing::{get, post},
    Json, Router,
};
use http::request::Parts;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::models::*;

/// Set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/enrollments", post(enroll))
        .route(
            "/api/students/:student_id/courses/:course_id/progress",
            get(progress),
        )
        .route(
            "/api/students/:student_id/courses/:course_id/lessons/:lesson_id/toggle",
            post(toggle_lesson),
        )
        .route(
            "/api/students/:student_id/courses/:course_id/recompute",
            post(recompute),
        )
        .route("/api/grades", post(record_grade))
        .route("/api/students/:student_id/badges", get(badges))
        .route("/api/students/:student_id/certificates", get(certificates))
        .route("/api/certificates/:serial", get(verify_certificate))
        .with_state(state)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("{USER_ID_HEADER} header missing")))?;
        let role = match header(USER_ROLE_HEADER) {
            Some(raw) => raw.parse::<Role>().map_err(ApiError::Unauthenticated)?,
            None => Role::Student,
        };
        Ok(Caller::new(user_id, role))
    }
}

async fn enroll(
    State(app): State<AppState>,
    caller: Caller,
    Json(req): Json<EnrollReq>,
) -> Result<Json<Enrollment>, ApiError> {
    let enrollment = app.enroll(&caller, &req.student_id, req.course_id).await?;
    Ok(Json(enrollment))
}

async fn progress(
    State(app): State<AppState>,
    caller: Caller,
    Path((student_id, course_id)): Path<(String, Uuid)>,
) -> Result<Json<ProgressView>, ApiError> {
    Ok(Json(app.get_progress(&caller, &student_id, course_id).await?))
}

async fn toggle_lesson(
    State(app): State<AppState>,
    caller: Caller,
    Path((student_id, course_id, lesson_id)): Path<(String, Uuid, String)>,
) -> Result<Json<ProgressOutcome>, ApiError> {
    let outcome = app
        .toggle_lesson(&caller, &student_id, course_id, &lesson_id)
        .await?;
    Ok(Json(outcome))
}

async fn recompute(
    State(app): State<AppState>,
    caller: Caller,
    Path((student_id, course_id)): Path<(String, Uuid)>,
) -> Result<Json<ProgressOutcome>, ApiError> {
    Ok(Json(app.recompute(&caller, &student_id, course_id).await?))
}

async fn record_grade(
    State(app): State<AppState>,
    caller: Caller,
    Json(event): Json<GradeEvent>,
) -> Result<Json<GradeOutcome>, ApiError> {
    Ok(Json(app.record_grade(&caller, &event).await?))
}

async fn badges(
    State(app): State<AppState>,
    caller: Caller,
    Path(student_id): Path<String>,
) -> Result<Json<Vec<EarnedBadge>>, ApiError> {
    Ok(Json(app.badges_for(&caller, &student_id).await?))
}

async fn certificates(
    State(app): State<AppState>,
    caller: Caller,
    Path(student_id): Path<String>,
) -> Result<Json<Vec<Certificate>>, ApiError> {
    Ok(Json(app.certificates_for(&caller, &student_id).await?))
}

async fn verify_certificate(
    State(app): State<AppState>,
    Path(serial): Path<String>,
) -> Result<Json<Certificate>, ApiError> {
    Ok(Json(app.verify_certificate(&serial).await?))
}

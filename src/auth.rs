use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use tracing::warn;

use crate::api::{ApiResponse, AppState};
use crate::errors::{ApiError, ErrorContext};

/// Identity headers set by the upstream session provider
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "USER" => Some(Role::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Missing user identity".to_string()))?;

        let role = headers
            .get(USER_ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| ApiError::Unauthorized("Missing or invalid user role".to_string()))?;

        Ok(CurrentUser {
            id: id.to_string(),
            role,
        })
    }

    fn require(self, role: Role) -> Result<Self, ApiError> {
        if self.role == role {
            Ok(self)
        } else {
            Err(ApiError::Forbidden(format!(
                "This operation requires the {:?} role",
                role
            )))
        }
    }
}

type Rejection = (StatusCode, Json<ApiResponse<()>>);

fn reject(error: ApiError) -> Rejection {
    error.to_response_with_context(ErrorContext::new("authenticate", "user"))
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        CurrentUser::from_headers(&parts.headers).map_err(reject)
    }
}

/// A caller with the ADMIN role
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        CurrentUser::from_headers(&parts.headers)
            .and_then(|user| user.require(Role::Admin))
            .map(AdminUser)
            .map_err(reject)
    }
}

/// A caller with the USER role, i.e. someone taking quizzes
#[derive(Debug, Clone)]
pub struct LearnerUser(pub CurrentUser);

#[async_trait]
impl<S> FromRequestParts<S> for LearnerUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        CurrentUser::from_headers(&parts.headers)
            .and_then(|user| user.require(Role::User))
            .map(LearnerUser)
            .map_err(reject)
    }
}

/// Reject non-admin traffic while maintenance mode is on. The admin API and
/// the health check stay reachable.
pub async fn maintenance_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path.starts_with("/api/admin") || path == "/health" {
        return next.run(request).await;
    }

    let is_admin = CurrentUser::from_headers(request.headers())
        .map(|user| user.role == Role::Admin)
        .unwrap_or(false);
    if is_admin {
        return next.run(request).await;
    }

    match state.quiz_service.get_settings().await {
        Ok(settings) if settings.maintenance_mode => {
            ApiError::ServiceUnavailable("The site is under maintenance".to_string())
                .to_response_with_context(ErrorContext::new("maintenance_gate", "settings"))
                .into_response()
        }
        Ok(_) => next.run(request).await,
        Err(e) => {
            warn!(error = %e, "Could not read settings, skipping maintenance check");
            next.run(request).await
        }
    }
}

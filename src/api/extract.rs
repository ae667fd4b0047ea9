use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::PipelineError;
use crate::models::{Caller, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Caller identity as set by the fronting auth adapter. A missing user id
/// or an unknown role is rejected; a missing role means attendee.
#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = PipelineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PipelineError::Authorization(format!("missing {USER_ID_HEADER} header")))?;

        let role = match parts.headers.get(USER_ROLE_HEADER) {
            None => Role::Attendee,
            Some(v) => v
                .to_str()
                .ok()
                .and_then(Role::parse)
                .ok_or_else(|| PipelineError::Authorization(format!("invalid {USER_ROLE_HEADER} header")))?,
        };
        Ok(Caller::new(user_id, role))
    }
}

// Caller identity extractors
//
// The engine sits behind the platform gateway, which authenticates the
// dashboard user and forwards the verified identity as headers. Nothing
// here validates credentials; the gateway strips these headers from
// external traffic.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::AppError;

/// Identity forwarded by the gateway in `x-user-id`. Required on the
/// dashboard-facing routes; ownership checks compare against it.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized("Missing caller identity".to_string()).into_response()
            })?;

        let user_id = header.parse::<Uuid>().map_err(|_| {
            AppError::Unauthorized("Malformed caller identity".to_string()).into_response()
        })?;

        Ok(CallerIdentity { user_id })
    }
}

/// Same header, but absent on traffic from the in-browser runtime. A
/// present-but-malformed value is still rejected.
#[derive(Debug, Clone, Copy)]
pub struct OptionalCaller(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for OptionalCaller
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = match parts.headers.get("x-user-id") {
            Some(value) => value,
            None => return Ok(OptionalCaller(None)),
        };

        let user_id = header
            .to_str()
            .ok()
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| {
                AppError::Unauthorized("Malformed caller identity".to_string()).into_response()
            })?;

        Ok(OptionalCaller(Some(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<CallerIdentity, Response> {
        let (mut parts, _) = request.into_parts();
        CallerIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn accepts_a_valid_uuid_header() {
        let user_id = Uuid::new_v4();
        let request = Request::builder()
            .header("x-user-id", user_id.to_string())
            .body(())
            .unwrap();

        let caller = extract(request).await.unwrap();
        assert_eq!(caller.user_id, user_id);
    }

    #[tokio::test]
    async fn rejects_missing_and_malformed_headers() {
        let missing = Request::builder().body(()).unwrap();
        assert!(extract(missing).await.is_err());

        let malformed = Request::builder()
            .header("x-user-id", "not-a-uuid")
            .body(())
            .unwrap();
        assert!(extract(malformed).await.is_err());
    }

    #[tokio::test]
    async fn optional_caller_tolerates_absence_but_not_garbage() {
        let absent = Request::builder().body(()).unwrap();
        let (mut parts, _) = absent.into_parts();
        let caller = OptionalCaller::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(caller.0.is_none());

        let garbage = Request::builder()
            .header("x-user-id", "nope")
            .body(())
            .unwrap();
        let (mut parts, _) = garbage.into_parts();
        assert!(OptionalCaller::from_request_parts(&mut parts, &())
            .await
            .is_err());
    }
}

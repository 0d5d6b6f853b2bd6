// Visitor tag endpoints
//
// Tags are written by workflow actions and read back by in-browser
// condition evaluation, so these routes are snippet-facing and scoped
// by (site, visitor) rather than by caller identity.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::validation_error;
use crate::{ApiResult, AppError, AppState};
use siteflow_shared::VisitorTagRecord;

const MAX_TAG_LENGTH: usize = 128;

#[derive(Debug, Deserialize)]
pub struct AddTagRequest {
    pub tag: String,
}

fn validate_tag(tag: &str) -> Result<(), AppError> {
    if tag.trim().is_empty() {
        return Err(validation_error("tag", "Tag must not be empty"));
    }
    if tag.len() > MAX_TAG_LENGTH {
        return Err(validation_error(
            "tag",
            &format!("Tag exceeds {} characters", MAX_TAG_LENGTH),
        ));
    }
    Ok(())
}

pub async fn list_tags(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<VisitorTagRecord>> {
    let tags: Vec<String> = sqlx::query_scalar(
        "SELECT tag FROM visitor_tags WHERE site_id = $1 AND visitor_id = $2 ORDER BY tag",
    )
    .bind(site_id)
    .bind(&visitor_id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(VisitorTagRecord {
        site_id,
        visitor_id,
        tags,
    }))
}

pub async fn has_tag(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id, tag)): Path<(Uuid, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let present: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM visitor_tags
            WHERE site_id = $1 AND visitor_id = $2 AND tag = $3
        )",
    )
    .bind(site_id)
    .bind(&visitor_id)
    .bind(&tag)
    .fetch_one(&state.db_pool)
    .await?;

    Ok(Json(json!({ "tag": tag, "present": present })))
}

pub async fn add_tag(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id)): Path<(Uuid, String)>,
    Json(request): Json<AddTagRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    validate_tag(&request.tag)?;

    // Re-tagging an already tagged visitor is a no-op, not a conflict
    sqlx::query(
        "INSERT INTO visitor_tags (site_id, visitor_id, tag)
         VALUES ($1, $2, $3)
         ON CONFLICT (site_id, visitor_id, tag) DO NOTHING",
    )
    .bind(site_id)
    .bind(&visitor_id)
    .bind(&request.tag)
    .execute(&state.db_pool)
    .await?;

    Ok((StatusCode::CREATED, Json(json!({ "tag": request.tag }))))
}

pub async fn remove_tag(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id, tag)): Path<(Uuid, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = sqlx::query(
        "DELETE FROM visitor_tags WHERE site_id = $1 AND visitor_id = $2 AND tag = $3",
    )
    .bind(site_id)
    .bind(&visitor_id)
    .bind(&tag)
    .execute(&state.db_pool)
    .await?;

    Ok(Json(json!({ "removed": result.rows_affected() > 0 })))
}

pub fn visitor_tag_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tags).post(add_tag))
        .route("/:tag", get(has_tag).delete(remove_tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_validation_rejects_empty_and_oversized() {
        assert!(validate_tag("vip").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("   ").is_err());
        assert!(validate_tag(&"x".repeat(MAX_TAG_LENGTH + 1)).is_err());
        assert!(validate_tag(&"x".repeat(MAX_TAG_LENGTH)).is_ok());
    }

    #[test]
    fn tag_validation_names_the_offending_field() {
        match validate_tag("") {
            Err(AppError::ValidationError { details }) => {
                assert!(details.contains_key("tag"));
            }
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[test]
    fn tag_record_serializes_camel_case() {
        let record = VisitorTagRecord {
            site_id: Uuid::nil(),
            visitor_id: "visitor-7".to_string(),
            tags: vec!["vip".to_string()],
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["visitorId"], "visitor-7");
        assert_eq!(value["tags"][0], "vip");
    }
}

// Event ingestion endpoint, called by the in-browser runtime

use axum::{extract::State, response::Json, routing::post, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{ApiResult, AppState};
use siteflow_shared::RawEvent;

/// The snippet posts either one event or a flushed batch; both shapes
/// land on the same route.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Single { event: RawEvent },
    Batch { events: Vec<RawEvent> },
}

impl IngestRequest {
    fn into_events(self) -> Vec<RawEvent> {
        match self {
            Self::Single { event } => vec![event],
            Self::Batch { events } => events,
        }
    }
}

pub async fn ingest_events(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let processed = state.ingestor.ingest_batch(request.into_events()).await?;
    Ok(Json(json!({ "success": true, "processed": processed })))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(ingest_events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn single_and_batch_shapes_both_parse() {
        let workflow_id = Uuid::new_v4();
        let site_id = Uuid::new_v4();

        let single: IngestRequest = serde_json::from_value(serde_json::json!({
            "event": {
                "siteId": site_id,
                "workflowId": workflow_id,
                "visitorId": "v1",
                "runId": "r1",
                "kind": "trigger"
            }
        }))
        .unwrap();
        assert_eq!(single.into_events().len(), 1);

        let batch: IngestRequest = serde_json::from_value(serde_json::json!({
            "events": [
                {"siteId": site_id, "workflowId": workflow_id, "visitorId": "v1", "runId": "r1", "kind": "trigger"},
                {"siteId": site_id, "workflowId": workflow_id, "visitorId": "v1", "runId": "r1", "kind": "workflow_completed"}
            ]
        }))
        .unwrap();
        assert_eq!(batch.into_events().len(), 2);
    }
}

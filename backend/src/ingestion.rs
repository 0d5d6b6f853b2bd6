// Event Ingestion - boundary for single and batch behavioral events
//
// One pass per request: validate, append to the raw event log, and apply
// one merged counter delta per workflow. Delivery is at-least-once;
// duplicate submissions double-count.

use siteflow_shared::RawEvent;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::analytics::aggregator::{merge_events, CounterAggregator};
use crate::error::{AppError, ValidationBuilder};

#[derive(Clone)]
pub struct EventIngestor {
    db_pool: PgPool,
    aggregator: CounterAggregator,
}

impl EventIngestor {
    pub fn new(db_pool: PgPool) -> Self {
        let aggregator = CounterAggregator::new(db_pool.clone());
        Self {
            db_pool,
            aggregator,
        }
    }

    /// Ingest a single event.
    pub async fn ingest(&self, event: RawEvent) -> Result<usize, AppError> {
        self.ingest_batch(vec![event]).await
    }

    /// Ingest a batch: write raw events, then apply one merged counter
    /// delta per workflow so N same-workflow events cost one counter write.
    pub async fn ingest_batch(&self, events: Vec<RawEvent>) -> Result<usize, AppError> {
        validate_batch(&events)?;

        let mut tx = self.db_pool.begin().await.map_err(AppError::from)?;
        for event in &events {
            sqlx::query(
                r#"
                INSERT INTO raw_events
                    (id, site_id, workflow_id, visitor_id, run_id, kind,
                     node_id, node_title, node_type, detail, step_order,
                     execution_time_ms, success, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(event.id)
            .bind(event.site_id)
            .bind(event.workflow_id)
            .bind(&event.visitor_id)
            .bind(&event.run_id)
            .bind(event.kind.as_str())
            .bind(&event.node_id)
            .bind(&event.node_title)
            .bind(&event.node_type)
            .bind(sqlx::types::Json(&event.detail))
            .bind(event.step_order)
            .bind(event.execution_time_ms)
            .bind(event.success)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
        }
        tx.commit().await.map_err(AppError::from)?;

        let deltas = merge_events(events.iter());
        self.aggregator.apply_batch(&deltas).await.map_err(AppError::from)?;

        debug!(
            "Ingested {} events across {} workflows",
            events.len(),
            deltas.len()
        );
        Ok(events.len())
    }
}

/// Minimal shape validation. Malformed payloads fail fast with a
/// validation error and are never retried.
fn validate_batch(events: &[RawEvent]) -> Result<(), AppError> {
    if events.is_empty() {
        return Err(AppError::bad_request("No events provided"));
    }

    let mut builder = ValidationBuilder::new();
    for (index, event) in events.iter().enumerate() {
        if event.site_id == Uuid::nil() {
            builder = builder.error(
                &format!("events[{}].siteId", index),
                "Site id is required",
            );
        }
        if event.workflow_id == Uuid::nil() {
            builder = builder.error(
                &format!("events[{}].workflowId", index),
                "Workflow id is required",
            );
        }
    }

    match builder.build() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use siteflow_shared::EventKind;

    fn event(site: Uuid, workflow: Uuid) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            site_id: site,
            workflow_id: workflow,
            visitor_id: "v1".to_string(),
            run_id: "r1".to_string(),
            kind: EventKind::Trigger,
            node_id: Some("N1".to_string()),
            node_title: None,
            node_type: None,
            detail: serde_json::Value::Null,
            step_order: None,
            execution_time_ms: None,
            success: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = validate_batch(&[]).unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[test]
    fn nil_ids_are_rejected_per_field() {
        let events = vec![event(Uuid::nil(), Uuid::new_v4()), event(Uuid::new_v4(), Uuid::nil())];
        let err = validate_batch(&events).unwrap_err();

        match err {
            AppError::ValidationError { details } => {
                assert!(details.contains_key("events[0].siteId"));
                assert!(details.contains_key("events[1].workflowId"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn well_formed_batch_passes_validation() {
        let events = vec![event(Uuid::new_v4(), Uuid::new_v4())];
        assert!(validate_batch(&events).is_ok());
    }
}

//! Append-only audit event rows.
//!
//! Personal identifiers are hashed by `lockerd-core` before they get here;
//! this module never sees a raw card id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::QueryBuilder;

use crate::error::StoreError;
use crate::Store;

/// A new audit event to append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kiosk_id: String,
    pub locker_id: Option<i64>,
    pub event_type: String,
    pub actor: String,
    pub details: serde_json::Value,
}

/// One stored audit event.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub kiosk_id: String,
    pub locker_id: Option<i64>,
    pub event_type: String,
    pub actor: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for event queries. All fields are optional and combine with AND.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i64>,
    pub event_type: Option<String>,
    pub actor: Option<String>,
    pub limit: Option<i64>,
}

impl Store {
    /// Append one audit event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the insert fails.
    pub async fn insert_event(
        &self,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO events (kiosk_id, locker_id, event_type, actor, details, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.kiosk_id)
        .bind(event.locker_id)
        .bind(&event.event_type)
        .bind(&event.actor)
        .bind(event.details.to_string())
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_write("events", &e))?;

        Ok(())
    }

    /// Query events matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn events(&self, filter: &EventFilter) -> Result<Vec<EventRow>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM events WHERE 1 = 1");

        if let Some(from) = filter.from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        if let Some(ref kiosk_id) = filter.kiosk_id {
            qb.push(" AND kiosk_id = ").push_bind(kiosk_id);
        }
        if let Some(locker_id) = filter.locker_id {
            qb.push(" AND locker_id = ").push_bind(locker_id);
        }
        if let Some(ref event_type) = filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(ref actor) = filter.actor {
            qb.push(" AND actor = ").push_bind(actor);
        }

        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(500));

        qb.build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "events",
                reason: e.to_string(),
            })
    }
}

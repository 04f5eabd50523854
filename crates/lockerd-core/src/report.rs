//! End-of-day bulk release and its fixed-schema CSV.
//!
//! Walks every locker of a kiosk and releases the ones that are owned or
//! reserved. VIP lockers are never released: excluded from the report by
//! default, listed as `skipped_vip` when explicitly included. Blocked
//! lockers are skipped by bulk operations and do not appear at all.
//!
//! CSV columns, in order: `kiosk_id, locker_id, timestamp, result,
//! previous_status, owner_key, error_message`. Timestamps are ISO-8601 UTC;
//! `owner_key` is the salted hash, never a raw card id.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use lockerd_store::LockerStatus;

use crate::error::{ReportError, StateError};
use crate::state::StateManager;

/// Outcome of one locker in the end-of-day run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EodResult {
    Success,
    Failed,
    SkippedVip,
    AlreadyFree,
}

impl EodResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::SkippedVip => "skipped_vip",
            Self::AlreadyFree => "already_free",
        }
    }
}

/// One row of the end-of-day report.
#[derive(Debug, Clone, Serialize)]
pub struct EodRow {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub timestamp: DateTime<Utc>,
    pub result: EodResult,
    pub previous_status: LockerStatus,
    pub owner_key: Option<String>,
    pub error_message: Option<String>,
}

impl StateManager {
    /// Release every owned or reserved non-VIP locker of a kiosk and report
    /// per-locker outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the locker scan fails; per-locker
    /// release failures are reported in their row, not as an error.
    pub async fn bulk_release_end_of_day(
        &self,
        kiosk_id: &str,
        include_vip: bool,
        actor: &str,
    ) -> Result<Vec<EodRow>, StateError> {
        let lockers = self.store().lockers_for_kiosk(kiosk_id).await?;
        let mut rows = Vec::with_capacity(lockers.len());

        for locker in lockers {
            let timestamp = Utc::now();
            if locker.status == LockerStatus::Blocked {
                continue;
            }
            if locker.is_vip {
                if include_vip {
                    rows.push(EodRow {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id: locker.id,
                        timestamp,
                        result: EodResult::SkippedVip,
                        previous_status: locker.status,
                        owner_key: locker.owner_key.clone(),
                        error_message: None,
                    });
                }
                continue;
            }

            match locker.status {
                LockerStatus::Free => rows.push(EodRow {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id: locker.id,
                    timestamp,
                    result: EodResult::AlreadyFree,
                    previous_status: LockerStatus::Free,
                    owner_key: None,
                    error_message: None,
                }),
                LockerStatus::Owned | LockerStatus::Reserved => {
                    let (result, error_message) =
                        match self.release(kiosk_id, locker.id, false, actor).await {
                            Ok(_) => (EodResult::Success, None),
                            Err(e) => (EodResult::Failed, Some(e.to_string())),
                        };
                    rows.push(EodRow {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id: locker.id,
                        timestamp,
                        result,
                        previous_status: locker.status,
                        owner_key: locker.owner_key.clone(),
                        error_message,
                    });
                }
                LockerStatus::Blocked => {}
            }
        }

        let released = rows.iter().filter(|r| r.result == EodResult::Success).count();
        info!(kiosk_id, released, total = rows.len(), "end-of-day bulk release complete");
        self.events()
            .log_or_warn(
                kiosk_id,
                None,
                "bulk_release",
                actor,
                serde_json::json!({ "released": released, "include_vip": include_vip }),
            )
            .await;

        Ok(rows)
    }
}

/// Render report rows as CSV with the fixed column order.
///
/// # Errors
///
/// Returns [`ReportError::Csv`] if serialization fails.
pub fn to_csv(rows: &[EodRow]) -> Result<String, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    writer
        .write_record([
            "kiosk_id",
            "locker_id",
            "timestamp",
            "result",
            "previous_status",
            "owner_key",
            "error_message",
        ])
        .map_err(|e| ReportError::Csv { reason: e.to_string() })?;

    for row in rows {
        writer
            .write_record([
                row.kiosk_id.as_str(),
                &row.locker_id.to_string(),
                &row.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                row.result.as_str(),
                row.previous_status.as_str(),
                row.owner_key.as_deref().unwrap_or(""),
                row.error_message.as_deref().unwrap_or(""),
            ])
            .map_err(|e| ReportError::Csv { reason: e.to_string() })?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ReportError::Csv { reason: e.to_string() })?;
    String::from_utf8(bytes).map_err(|e| ReportError::Csv { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLogger;
    use crate::state::Owner;
    use lockerd_store::Store;
    use std::sync::Arc;

    /// 50 lockers: 5 VIP owned (1–5), 10 owned (6–15), 2 reserved (16–17),
    /// 33 free.
    async fn spa_at_closing_time() -> StateManager {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventLogger::init(store.clone()).await.unwrap());
        let m = StateManager::new(store, events);
        m.sync_lockers("K1", 50).await.unwrap();

        for i in 1..=5 {
            m.vip_bind("K1", i, &format!("vip-{i}"), "staff:ana").await.unwrap();
        }
        for i in 6..=15 {
            let owner = Owner::Rfid(format!("card-{i}"));
            m.assign("K1", i, &owner, "system").await.unwrap();
            m.confirm("K1", i, &owner, "system").await.unwrap();
        }
        for i in 16..=17 {
            m.assign("K1", i, &Owner::Rfid(format!("card-{i}")), "system").await.unwrap();
        }
        m
    }

    #[tokio::test]
    async fn default_run_excludes_vip_and_frees_the_rest() {
        let m = spa_at_closing_time().await;

        let rows = m.bulk_release_end_of_day("K1", false, "staff:ana").await.unwrap();
        assert_eq!(rows.len(), 45);

        let count = |r: EodResult| rows.iter().filter(|row| row.result == r).count();
        assert_eq!(count(EodResult::Success), 12);
        assert_eq!(count(EodResult::AlreadyFree), 33);
        assert_eq!(count(EodResult::SkippedVip), 0);

        // All non-VIP lockers are now free; VIP lockers untouched.
        for locker in m.all("K1", None).await.unwrap() {
            if locker.is_vip {
                assert_eq!(locker.status, LockerStatus::Owned);
            } else {
                assert_eq!(locker.status, LockerStatus::Free);
            }
        }
    }

    #[tokio::test]
    async fn included_vip_lockers_show_as_skipped() {
        let m = spa_at_closing_time().await;

        let rows = m.bulk_release_end_of_day("K1", true, "staff:ana").await.unwrap();
        assert_eq!(rows.len(), 50);

        let skipped: Vec<_> = rows
            .iter()
            .filter(|r| r.result == EodResult::SkippedVip)
            .collect();
        assert_eq!(skipped.len(), 5);
        assert!(skipped
            .iter()
            .all(|r| r.previous_status == LockerStatus::Owned && r.owner_key.is_some()));

        // Still owned: including VIP in the report never releases them.
        assert_eq!(
            m.locker("K1", 1).await.unwrap().status,
            LockerStatus::Owned
        );
    }

    #[tokio::test]
    async fn blocked_lockers_are_skipped_entirely() {
        let m = spa_at_closing_time().await;
        m.block("K1", 20, "jammed", false, "staff:ana").await.unwrap();

        let rows = m.bulk_release_end_of_day("K1", false, "staff:ana").await.unwrap();
        assert_eq!(rows.len(), 44);
        assert!(rows.iter().all(|r| r.locker_id != 20));
        assert_eq!(
            m.locker("K1", 20).await.unwrap().status,
            LockerStatus::Blocked
        );
    }

    #[tokio::test]
    async fn csv_has_the_fixed_schema() {
        let m = spa_at_closing_time().await;
        let rows = m.bulk_release_end_of_day("K1", false, "staff:ana").await.unwrap();
        let csv = to_csv(&rows).unwrap();

        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("kiosk_id,locker_id,timestamp,result,previous_status,owner_key,error_message")
        );
        assert_eq!(lines.count(), 45);

        let released_line = csv
            .lines()
            .find(|l| l.contains(",success,"))
            .expect("a success row");
        assert!(released_line.starts_with("K1,"));
        assert!(released_line.contains(",owned,") || released_line.contains(",reserved,"));
        // ISO-8601 UTC timestamp.
        assert!(released_line.contains('T') && released_line.contains('Z'));
    }
}

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::Result;
use crate::event::Event;
use crate::sqlite::SqliteEventStore;
use crate::store::EventStore;

/// Stream receiving storage alert events.
const STORAGE_STREAM: &str = "system_storage";

/// Minimum gap between repeated alerts for the same table.
const ALERT_COOLDOWN_MINUTES: i64 = 60;

/// Row-count thresholds per monitored table.
#[derive(Debug, Clone)]
pub struct StorageThresholds {
    pub warn_rows: u64,
    pub critical_rows: u64,
}

impl Default for StorageThresholds {
    fn default() -> Self {
        Self {
            warn_rows: 500_000,
            critical_rows: 2_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageAlert {
    pub table: String,
    pub rows: u64,
    pub level: &'static str,
}

/// Watches hot-table growth and records `StorageAlertEvent`s, with a
/// per-table cooldown so a standing condition does not flood the log.
pub struct StorageMonitor {
    store: Arc<SqliteEventStore>,
    thresholds: StorageThresholds,
    last_alerts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StorageMonitor {
    pub fn new(store: Arc<SqliteEventStore>, thresholds: StorageThresholds) -> Self {
        Self {
            store,
            thresholds,
            last_alerts: Mutex::new(HashMap::new()),
        }
    }

    /// One threshold pass over the monitored tables.
    pub async fn check(&self) -> Result<Vec<StorageAlert>> {
        let sizes = self.store.table_sizes()?;
        let mut alerts = Vec::new();
        for (table, rows) in sizes {
            let level = if rows >= self.thresholds.critical_rows {
                "critical"
            } else if rows >= self.thresholds.warn_rows {
                "warning"
            } else {
                continue;
            };
            alerts.push(StorageAlert { table, rows, level });
        }

        for alert in &alerts {
            if !self.cooldown_elapsed(&alert.table) {
                continue;
            }
            warn!(table = %alert.table, rows = alert.rows, level = alert.level, "storage alert");
            self.emit_alert(alert).await;
        }
        Ok(alerts)
    }

    fn cooldown_elapsed(&self, table: &str) -> bool {
        let mut last = self.last_alerts.lock().unwrap();
        let now = Utc::now();
        match last.get(table) {
            Some(at) if now - *at < ChronoDuration::minutes(ALERT_COOLDOWN_MINUTES) => false,
            _ => {
                last.insert(table.to_string(), now);
                true
            }
        }
    }

    async fn emit_alert(&self, alert: &StorageAlert) {
        let store: Arc<dyn EventStore> = self.store.clone();
        let version = match store.get_last_event(STORAGE_STREAM).await {
            Ok(Some(last)) => last.version() + 1,
            _ => 0,
        };
        let event = Event::new(
            STORAGE_STREAM,
            "StorageAlertEvent",
            json!({
                "table": alert.table,
                "rows": alert.rows,
                "level": alert.level,
            }),
        )
        .with_version(version);
        if let Err(e) = store.append(event).await {
            warn!(error = %e, "failed to record StorageAlertEvent");
        }
    }

    /// Periodic monitoring loop; the owner aborts the handle on shutdown.
    pub fn spawn_periodic(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.check().await {
                    error!(error = %e, "storage check failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_core::config::EventStoreConfig;
    use rusqlite::Connection;
    use serde_json::json;

    #[tokio::test]
    async fn alert_fires_once_per_cooldown() {
        let conn = Connection::open_in_memory().unwrap();
        let store = Arc::new(
            SqliteEventStore::with_connection(
                conn,
                &EventStoreConfig {
                    batch_size: 1,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        store
            .append(Event::new("s1", "A", json!({})).with_version(0))
            .await
            .unwrap();

        let monitor = StorageMonitor::new(
            store.clone(),
            StorageThresholds {
                warn_rows: 1,
                critical_rows: 100,
            },
        );
        let alerts = monitor.check().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, "warning");

        // Second pass still reports, but records no second event.
        monitor.check().await.unwrap();
        let recorded = store.get_stream("system_storage", 0).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event_type(), "StorageAlertEvent");
    }
}

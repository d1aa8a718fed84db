use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::records::{Expiry, StoredRecord};
use crate::storage::KeyValueStore;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub deleted: u64,
    pub errors: u64,
    pub checked: u64,
}

enum Verdict {
    Keep,
    Delete,
    Vanished,
}

/// Reclaims anything left behind in the store once it is past its expiry.
pub struct PurgeSweeper {
    store: Arc<dyn KeyValueStore>,
    ttl: chrono::Duration,
}

impl PurgeSweeper {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: chrono::Duration) -> Self {
        Self { store, ttl }
    }

    /// Runs the sweeper on a fixed interval until the runtime shuts down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                if let Err(e) = self.run().await {
                    error!(error = %e, "Purge run failed");
                }
            }
        })
    }

    pub async fn run(&self) -> anyhow::Result<PurgeSummary> {
        self.run_at(Utc::now()).await
    }

    /// Scans every key and deletes whatever is stale at `now`.
    ///
    /// Only a failure to list the store aborts the run, a failure on a
    /// single item counts as an error and the item is deleted anyway.
    pub async fn run_at(&self, now: DateTime<Utc>) -> anyhow::Result<PurgeSummary> {
        let keys = self.store.list().await?;
        let mut summary = PurgeSummary::default();

        for key in keys {
            summary.checked += 1;

            match self.inspect(&key, now).await {
                Ok(Verdict::Keep) | Ok(Verdict::Vanished) => {},
                Ok(Verdict::Delete) => match self.store.delete(&key).await {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to delete stale record");
                        summary.errors += 1;
                    },
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to inspect record, deleting it");
                    summary.errors += 1;
                    if self.store.delete(&key).await.is_ok() {
                        summary.deleted += 1;
                    }
                },
            }
        }

        info!(
            deleted = summary.deleted,
            errors = summary.errors,
            checked = summary.checked,
            "Purge complete"
        );

        Ok(summary)
    }

    async fn inspect(&self, key: &str, now: DateTime<Utc>) -> anyhow::Result<Verdict> {
        let data = match self.store.get(key).await? {
            Some(data) => data,
            None => return Ok(Verdict::Vanished),
        };

        let record = match StoredRecord::parse(key, &data) {
            Ok(record) => record,
            Err(e) => {
                debug!(key = %key, error = %e, "Discarding corrupt record");
                return Ok(Verdict::Delete);
            },
        };

        match record.expires_at(self.ttl) {
            Some(expires_at) if now <= expires_at => Ok(Verdict::Keep),
            Some(_) => Ok(Verdict::Delete),
            None => {
                debug!(key = %key, "Discarding record with no timestamp");
                Ok(Verdict::Delete)
            },
        }
    }
}

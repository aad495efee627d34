//! Daily reconciliation of the directory against the provider's user list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::directory::UserDirectory;
use crate::identity_provider::IdentityProvider;
use crate::sync::{sync_provider_user, SyncOutcome};

/// A user that could not be reconciled during a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialSyncFailure {
    pub external_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub checked: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// A page fetch failed and the remaining pages were not visited
    pub aborted: bool,
    pub failures: Vec<PartialSyncFailure>,
}

pub struct ReconciliationSweep {
    provider: Arc<dyn IdentityProvider>,
    directory: Arc<dyn UserDirectory>,
    batch_size: u32,
}

impl ReconciliationSweep {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserDirectory>,
        batch_size: u32,
    ) -> Self {
        Self {
            provider,
            directory,
            batch_size: batch_size.max(1),
        }
    }

    /// Walk every provider user once.
    ///
    /// Per-user failures, including records that do not decode, are recorded
    /// and skipped. A failed page fetch stops
    /// the sweep but keeps the counts gathered so far; there is no cursor, the
    /// next run starts from the first page again.
    pub async fn run(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let mut offset: u32 = 0;

        tracing::info!(batch_size = self.batch_size, "Starting reconciliation sweep");

        loop {
            let page = match self.provider.list_users(self.batch_size, offset).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(offset, "Failed to fetch user page, aborting sweep: {}", e);
                    report.aborted = true;
                    break;
                }
            };

            let fetched = page.len();
            for entry in &page {
                report.checked += 1;
                let user = match entry {
                    Ok(user) => user,
                    Err(malformed) => {
                        tracing::warn!(
                            external_id = %malformed.id,
                            "Unreadable provider user record: {}",
                            malformed.reason
                        );
                        report.errors += 1;
                        report.failures.push(PartialSyncFailure {
                            external_id: malformed.id.clone(),
                            message: format!("unreadable record: {}", malformed.reason),
                        });
                        continue;
                    }
                };

                match sync_provider_user(self.directory.as_ref(), user).await {
                    Ok(SyncOutcome::Created(_)) => report.created += 1,
                    Ok(SyncOutcome::Updated(_)) => report.updated += 1,
                    Ok(SyncOutcome::Unchanged(_)) => {}
                    Ok(SyncOutcome::Skipped(_)) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(external_id = %user.id, "Failed to reconcile user: {}", e);
                        report.errors += 1;
                        report.failures.push(PartialSyncFailure {
                            external_id: user.id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if fetched < self.batch_size as usize {
                break;
            }
            offset = offset.saturating_add(self.batch_size);
        }

        tracing::info!(
            checked = report.checked,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            aborted = report.aborted,
            "Reconciliation sweep finished"
        );
        report
    }

    /// Run the sweep every day at `run_at_hour` UTC.
    pub fn spawn_daily(self: Arc<Self>, run_at_hour: u32) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_run_after(now, run_at_hour);
                let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
                tracing::info!(next_run = %next, "Next reconciliation sweep scheduled");

                tokio::time::sleep(wait).await;
                self.run().await;
            }
        })
    }
}

/// The first `hour:00` UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);

    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

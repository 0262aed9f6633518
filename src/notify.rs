use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;

/// Progress of a running fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanoutProgress {
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
}

impl FanoutProgress {
    /// Computes `percentage` from `current` and `total`.
    pub fn new(current: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            current as f64 * 100.0 / total as f64
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// Options for [`Notifier::send_to_all`].
#[derive(Clone, Debug, Default)]
pub struct FanoutOptions {
    /// Message markup, e.g. `HTML`.
    pub parse_mode: Option<String>,
    /// Receives a [`FanoutProgress`] per delivered batch. Send errors are ignored.
    pub progress: Option<mpsc::UnboundedSender<FanoutProgress>>,
}

impl FanoutOptions {
    pub fn parse_mode(mut self, mode: impl Into<String>) -> Self {
        self.parse_mode = Some(mode.into());
        self
    }

    pub fn progress(mut self, sender: mpsc::UnboundedSender<FanoutProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Reports progress if anyone is listening.
    pub fn report(&self, current: u64, total: u64) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(FanoutProgress::new(current, total));
        }
    }
}

/// Result of a fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanoutReport {
    pub notified_count: u64,
    pub total_users: u64,
    pub success_rate: f64,
    pub failed_count: u64,
}

impl FanoutReport {
    /// Builds a report from delivery counts.
    pub fn from_counts(notified_count: u64, total_users: u64) -> Self {
        let success_rate = if total_users == 0 {
            0.0
        } else {
            notified_count as f64 * 100.0 / total_users as f64
        };
        Self {
            notified_count,
            total_users,
            success_rate,
            failed_count: total_users.saturating_sub(notified_count),
        }
    }
}

/// Broadcasts a message to every subscribed recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_to_all(
        &self,
        text: &str,
        options: FanoutOptions,
    ) -> Result<FanoutReport, StoreError>;
}

/// Persists when subscribers were last notified.
///
/// One store is shared by every workflow that notifies the same audience.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn last_notification(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Replaces the stored timestamp with `new` only if it still equals
    /// `expected`, as one atomic step (e.g. `UPDATE ... WHERE last = $1`).
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}

/// Result of [`claim_cooldown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownClaim {
    /// The caller owns this notification; `previous` is what the store held.
    Claimed { previous: Option<DateTime<Utc>> },
    /// The cooldown is still running since `last`.
    Cooling { last: Option<DateTime<Utc>> },
}

/// Claims the next notification at `now` unless the cooldown is still running.
///
/// Of several concurrent callers at most one gets [`CooldownClaim::Claimed`].
pub async fn claim_cooldown(
    store: &dyn CooldownStore,
    now: DateTime<Utc>,
    cooldown_days: u32,
) -> Result<CooldownClaim, StoreError> {
    let mut last = store.last_notification().await?;
    loop {
        if !cooldown_elapsed(last, now, cooldown_days) {
            return Ok(CooldownClaim::Cooling { last });
        }
        if store.compare_and_set(last, Some(now)).await? {
            return Ok(CooldownClaim::Claimed { previous: last });
        }
        // Lost the race; the winner's timestamp decides.
        last = store.last_notification().await?;
    }
}

/// Whether a notification is due given the last send and a cooldown in days.
///
/// Never notified means due.
pub fn cooldown_elapsed(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown_days: u32,
) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_days() >= i64::from(cooldown_days),
    }
}

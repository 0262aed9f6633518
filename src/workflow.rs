//! Registry refresh saga.
//!
//! A refresh pulls the latest copy of a remote registry through the task
//! workers and replaces the local table with it:
//!
//! 1. validate the community id;
//! 2. ask for the latest metadata (reference date);
//! 3. fetch the full dataset for that date;
//! 4. replace the local table in one unit of work;
//! 5. copy the rows into history for that date (delete then insert);
//! 6. notify subscribers unless the cooldown has not elapsed;
//! 7. return a [`RefreshSummary`].
//!
//! Steps 1 to 5 abort the run with [`Error::Workflow`]. Step 6 never fails
//! the run. Nothing is retried; calling again is safe because steps 4 and 5
//! are idempotent for a given date.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::WorkflowConfig;
use crate::dispatcher::{TaskDispatcher, TaskResult};
use crate::error::{Error, Result, StoreError, WorkflowStep};
use crate::notify::{
    CooldownClaim, CooldownStore, FanoutOptions, FanoutProgress, FanoutReport, Notifier,
    claim_cooldown,
};
use crate::settings::CommunityNameSource;
use crate::types::{CommunityId, TaskName};

/// One registry row as delivered by the workers.
pub type RegistryRecord = Map<String, Value>;

/// Remote registries the saga knows how to refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Debtors of local taxes and fees.
    Debtor,
    /// Taxpayer register.
    Tax,
}

impl RegistryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debtor => "debtor",
            Self::Tax => "tax",
        }
    }

    /// Task returning the latest reference date.
    pub fn metadata_task(self) -> TaskName {
        TaskName::from_string(format!("{}.get_latest_metadata", self.as_str()))
    }

    /// Task returning the full dataset for a date.
    pub fn bulk_task(self) -> TaskName {
        TaskName::from_string(format!("{}.fetch_all", self.as_str()))
    }

    /// Subscriber message announcing a refresh.
    pub fn notification_text(self, community_name: &str, date: NaiveDate, rows: u64) -> String {
        let registry = match self {
            Self::Debtor => "debtor registry",
            Self::Tax => "tax register",
        };
        format!(
            "<b>{community_name}</b>: the {registry} was updated to {}. Records: {rows}.",
            date.format("%d.%m.%Y")
        )
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local storage of registry rows and their history.
#[async_trait]
pub trait RegistryRepository: Send + Sync {
    /// Replaces every row of `kind` with `records` as one unit of work.
    ///
    /// On error the previous rows must still be in place. Returns the number
    /// of rows inserted.
    async fn replace_all(
        &self,
        kind: RegistryKind,
        records: Vec<RegistryRecord>,
    ) -> std::result::Result<u64, StoreError>;

    /// Copies the current rows of `kind` into history under `date`, first
    /// deleting whatever history that date already has. Returns the number
    /// of history rows for `date`.
    async fn import_history(
        &self,
        kind: RegistryKind,
        date: NaiveDate,
    ) -> std::result::Result<u64, StoreError>;
}

#[async_trait]
impl<T: RegistryRepository + ?Sized> RegistryRepository for Arc<T> {
    async fn replace_all(
        &self,
        kind: RegistryKind,
        records: Vec<RegistryRecord>,
    ) -> std::result::Result<u64, StoreError> {
        (**self).replace_all(kind, records).await
    }

    async fn import_history(
        &self,
        kind: RegistryKind,
        date: NaiveDate,
    ) -> std::result::Result<u64, StoreError> {
        (**self).import_history(kind, date).await
    }
}

/// Checks that a community id is one this deployment serves.
#[async_trait]
pub trait CommunityValidator: Send + Sync {
    async fn is_valid(&self, community: &CommunityId) -> std::result::Result<bool, StoreError>;
}

#[async_trait]
impl<T: CommunityValidator + ?Sized> CommunityValidator for Arc<T> {
    async fn is_valid(&self, community: &CommunityId) -> std::result::Result<bool, StoreError> {
        (**self).is_valid(community).await
    }
}

/// Outcome of the notification step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationOutcome {
    /// Subscribers were notified.
    Sent(FanoutReport),
    /// The cooldown has not elapsed since `last_notification`.
    Skipped {
        last_notification: Option<DateTime<Utc>>,
    },
    /// No notifier is configured.
    Disabled,
    /// The step failed; the refresh itself still succeeded.
    Failed { message: String },
}

/// Result of a successful refresh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub kind: RegistryKind,
    pub community: CommunityId,
    pub fetched: u64,
    pub inserted: u64,
    pub import_date: NaiveDate,
    pub history_rows: u64,
    pub notification: NotificationOutcome,
    pub notification_skipped: bool,
    pub completed_at: DateTime<Utc>,
}

struct Notification {
    notifier: Arc<dyn Notifier>,
    cooldown: Arc<dyn CooldownStore>,
}

/// Builder for [`RegistryRefresh`].
pub struct RegistryRefreshBuilder<B, R, V> {
    kind: RegistryKind,
    dispatcher: Arc<TaskDispatcher<B>>,
    repository: R,
    validator: V,
    config: WorkflowConfig,
    community_name: Option<Arc<dyn CommunityNameSource>>,
    notification: Option<Notification>,
    progress: Option<mpsc::UnboundedSender<FanoutProgress>>,
}

impl<B, R, V> RegistryRefreshBuilder<B, R, V> {
    /// Timeouts, cooldown and default community name.
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixed name shown in notifications.
    pub fn community_name(mut self, name: impl Into<String>) -> Self {
        let name: String = name.into();
        self.community_name = Some(Arc::new(name));
        self
    }

    /// Reads the name from `source` (e.g. a [`SettingsService`]) on every run.
    ///
    /// [`SettingsService`]: crate::SettingsService
    pub fn community_name_source(mut self, source: Arc<dyn CommunityNameSource>) -> Self {
        self.community_name = Some(source);
        self
    }

    /// Enables step 6.
    pub fn notifier(
        mut self,
        notifier: Arc<dyn Notifier>,
        cooldown: Arc<dyn CooldownStore>,
    ) -> Self {
        self.notification = Some(Notification { notifier, cooldown });
        self
    }

    /// Forwards fan-out progress to `sender`.
    pub fn progress(mut self, sender: mpsc::UnboundedSender<FanoutProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn build(self) -> RegistryRefresh<B, R, V> {
        RegistryRefresh {
            kind: self.kind,
            dispatcher: self.dispatcher,
            repository: self.repository,
            validator: self.validator,
            config: self.config,
            community_name: self.community_name,
            notification: self.notification,
            progress: self.progress,
            running: Mutex::new(HashSet::new()),
        }
    }
}

/// Registry refresh for one [`RegistryKind`].
///
/// At most one run per community is in flight per instance; a second
/// concurrent call fails with [`Error::WorkflowBusy`].
pub struct RegistryRefresh<B, R, V> {
    kind: RegistryKind,
    dispatcher: Arc<TaskDispatcher<B>>,
    repository: R,
    validator: V,
    config: WorkflowConfig,
    community_name: Option<Arc<dyn CommunityNameSource>>,
    notification: Option<Notification>,
    progress: Option<mpsc::UnboundedSender<FanoutProgress>>,
    running: Mutex<HashSet<CommunityId>>,
}

// Releases the per-community slot when the run ends or is dropped.
struct RunSlot<'a> {
    running: &'a Mutex<HashSet<CommunityId>>,
    community: CommunityId,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.community);
    }
}

fn lock(running: &Mutex<HashSet<CommunityId>>) -> MutexGuard<'_, HashSet<CommunityId>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B, R, V> RegistryRefresh<B, R, V> {
    /// Starts a builder with default [`WorkflowConfig`] and no notifier.
    pub fn builder(
        kind: RegistryKind,
        dispatcher: Arc<TaskDispatcher<B>>,
        repository: R,
        validator: V,
    ) -> RegistryRefreshBuilder<B, R, V> {
        RegistryRefreshBuilder {
            kind,
            dispatcher,
            repository,
            validator,
            config: WorkflowConfig::default(),
            community_name: None,
            notification: None,
            progress: None,
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    fn claim(&self, community: &CommunityId) -> Result<RunSlot<'_>> {
        if !lock(&self.running).insert(community.clone()) {
            return Err(Error::WorkflowBusy(community.clone()));
        }
        Ok(RunSlot {
            running: &self.running,
            community: community.clone(),
        })
    }
}

impl<B, R, V> RegistryRefresh<B, R, V>
where
    B: Broker,
    R: RegistryRepository,
    V: CommunityValidator,
{
    /// Runs the whole saga for `community`.
    pub async fn run(&self, community: &CommunityId) -> Result<RefreshSummary> {
        let _slot = self.claim(community)?;
        info!(kind = %self.kind, community = %community, "registry refresh started");

        match self.validator.is_valid(community).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::Validation(format!("unknown community {community}"))
                    .at_step(WorkflowStep::Validate));
            }
            Err(err) => return Err(Error::Store(err).at_step(WorkflowStep::Validate)),
        }

        let import_date = self
            .fetch_metadata(community)
            .await
            .map_err(|err| err.at_step(WorkflowStep::FetchMetadata))?;

        let records = self
            .fetch_bulk(community, import_date)
            .await
            .map_err(|err| err.at_step(WorkflowStep::FetchBulk))?;
        let fetched = records.len() as u64;

        let inserted = self
            .repository
            .replace_all(self.kind, records)
            .await
            .map_err(|err| Error::Store(err).at_step(WorkflowStep::ReplaceLocal))?;

        let history_rows = self
            .repository
            .import_history(self.kind, import_date)
            .await
            .map_err(|err| Error::Store(err).at_step(WorkflowStep::ImportHistory))?;

        let notification = self.notify(import_date, inserted).await;
        let summary = RefreshSummary {
            kind: self.kind,
            community: community.clone(),
            fetched,
            inserted,
            import_date,
            history_rows,
            notification_skipped: !matches!(notification, NotificationOutcome::Sent(_)),
            notification,
            completed_at: Utc::now(),
        };
        info!(
            kind = %self.kind,
            community = %community,
            fetched,
            inserted,
            history_rows,
            import_date = %import_date,
            notification_skipped = summary.notification_skipped,
            "registry refresh completed"
        );
        Ok(summary)
    }

    async fn fetch_metadata(&self, community: &CommunityId) -> Result<NaiveDate> {
        let task = self.kind.metadata_task();
        let reply = self
            .dispatcher
            .send_task_with_reply(
                &task,
                json!({ "community": community }),
                self.config.metadata_timeout(),
            )
            .await?;
        let result = TaskResult::require_success(&task, reply)?;
        result
            .field("date")
            .and_then(Value::as_str)
            .and_then(parse_reference_date)
            .ok_or_else(|| Error::UpstreamApplication {
                task: task.to_string(),
                message: "metadata has no reference date".to_string(),
            })
    }

    async fn fetch_bulk(&self, community: &CommunityId, date: NaiveDate) -> Result<Vec<RegistryRecord>> {
        let task = self.kind.bulk_task();
        let reply = self
            .dispatcher
            .send_task_with_reply(
                &task,
                json!({ "community": community, "date": date }),
                self.config.bulk_timeout(),
            )
            .await?;
        let result = TaskResult::require_success(&task, reply)?;
        let malformed = |message: &str| Error::UpstreamApplication {
            task: task.to_string(),
            message: message.to_string(),
        };

        let rows = result
            .field("records")
            .or_else(|| result.fields.get("data"))
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("dataset has no records"))?;
        if rows.is_empty() {
            return Err(malformed("dataset is empty"));
        }
        rows.iter()
            .map(|row| {
                row.as_object()
                    .cloned()
                    .ok_or_else(|| malformed("dataset row is not an object"))
            })
            .collect()
    }

    async fn notify(&self, date: NaiveDate, rows: u64) -> NotificationOutcome {
        let Some(notification) = &self.notification else {
            return NotificationOutcome::Disabled;
        };
        match self.try_notify(notification, date, rows).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "notification fan-out failed");
                NotificationOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn try_notify(
        &self,
        notification: &Notification,
        date: NaiveDate,
        rows: u64,
    ) -> std::result::Result<NotificationOutcome, StoreError> {
        let now = Utc::now();
        let cooldown = notification.cooldown.as_ref();
        let previous =
            match claim_cooldown(cooldown, now, self.config.notification_cooldown_days).await? {
                CooldownClaim::Claimed { previous } => previous,
                CooldownClaim::Cooling { last } => {
                    info!(kind = %self.kind, "notification skipped, cooldown active");
                    return Ok(NotificationOutcome::Skipped {
                        last_notification: last,
                    });
                }
            };

        let name = self.resolve_community_name().await;
        let mut options = FanoutOptions::default().parse_mode("HTML");
        options.progress = self.progress.clone();
        let report = match notification
            .notifier
            .send_to_all(&self.kind.notification_text(&name, date, rows), options)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                // Hand the slot back unless someone has claimed it since.
                if let Err(release_err) = cooldown.compare_and_set(Some(now), previous).await {
                    warn!(kind = %self.kind, error = %release_err, "cooldown release failed");
                }
                return Err(err);
            }
        };
        info!(
            kind = %self.kind,
            notified = report.notified_count,
            total = report.total_users,
            "subscribers notified"
        );
        Ok(NotificationOutcome::Sent(report))
    }

    async fn resolve_community_name(&self) -> String {
        let Some(source) = &self.community_name else {
            return self.config.default_community_name.clone();
        };
        match source.community_name().await {
            Ok(name) => name,
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "community name lookup failed, using default");
                self.config.default_community_name.clone()
            }
        }
    }
}

// Workers report either an ISO date, an RFC 3339 timestamp or `dd.mm.yyyy`.
fn parse_reference_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(raw, "%d.%m.%Y").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{TaskEnvelope, TaskReply};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    type Script = dyn Fn(&TaskEnvelope) -> Option<TaskReply> + Send + Sync;

    // Answers each publish from a script, straight into the dispatcher.
    struct ScriptedBroker {
        dispatcher: Arc<OnceLock<Weak<TaskDispatcher<ScriptedBroker>>>>,
        script: Box<Script>,
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn publish(
            &self,
            _queue: &str,
            envelope: TaskEnvelope,
        ) -> std::result::Result<(), StoreError> {
            let dispatcher = self.dispatcher.get().and_then(Weak::upgrade);
            if let (Some(reply), Some(dispatcher)) = ((self.script)(&envelope), dispatcher) {
                dispatcher.deliver(reply);
            }
            Ok(())
        }
    }

    fn scripted(
        script: impl Fn(&TaskEnvelope) -> Option<TaskReply> + Send + Sync + 'static,
    ) -> Arc<TaskDispatcher<ScriptedBroker>> {
        let slot = Arc::new(OnceLock::new());
        let dispatcher = Arc::new(TaskDispatcher::new(ScriptedBroker {
            dispatcher: Arc::clone(&slot),
            script: Box::new(script),
        }));
        let _ = slot.set(Arc::downgrade(&dispatcher));
        dispatcher
    }

    fn happy_worker(envelope: &TaskEnvelope) -> Option<TaskReply> {
        let result = match envelope.name.as_str() {
            "debtor.get_latest_metadata" | "tax.get_latest_metadata" => {
                json!({"success": true, "data": {"date": "2026-10-01"}})
            }
            "debtor.fetch_all" | "tax.fetch_all" => json!({
                "success": true,
                "records": [{"name": "A", "debt": 10}, {"name": "B", "debt": 20}]
            }),
            other => json!({"success": false, "error": format!("unknown task {other}")}),
        };
        Some(TaskReply::ok(envelope.correlation_id.clone(), result))
    }

    #[derive(Default)]
    struct Repo {
        rows: Mutex<Vec<RegistryRecord>>,
        history: Mutex<BTreeMap<NaiveDate, Vec<RegistryRecord>>>,
        fail_replace: AtomicBool,
    }

    #[async_trait]
    impl RegistryRepository for Repo {
        async fn replace_all(
            &self,
            _kind: RegistryKind,
            records: Vec<RegistryRecord>,
        ) -> std::result::Result<u64, StoreError> {
            if self.fail_replace.load(Ordering::SeqCst) {
                return Err("deadlock detected".into());
            }
            let count = records.len() as u64;
            *self.rows.lock().unwrap() = records;
            Ok(count)
        }

        async fn import_history(
            &self,
            _kind: RegistryKind,
            date: NaiveDate,
        ) -> std::result::Result<u64, StoreError> {
            let rows = self.rows.lock().unwrap().clone();
            let count = rows.len() as u64;
            self.history.lock().unwrap().insert(date, rows);
            Ok(count)
        }
    }

    struct Communities(&'static [&'static str]);

    #[async_trait]
    impl CommunityValidator for Communities {
        async fn is_valid(&self, community: &CommunityId) -> std::result::Result<bool, StoreError> {
            Ok(self.0.contains(&community.as_str()))
        }
    }

    #[derive(Default)]
    struct Subscribers {
        calls: AtomicUsize,
        fail: AtomicBool,
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Subscribers {
        async fn send_to_all(
            &self,
            text: &str,
            options: FanoutOptions,
        ) -> std::result::Result<FanoutReport, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.lock().unwrap().push(text.to_string());
            // Delivery takes a while; let other runs interleave.
            tokio::task::yield_now().await;
            assert!(text.contains("01.10.2026"));
            assert_eq!(options.parse_mode.as_deref(), Some("HTML"));
            if self.fail.load(Ordering::SeqCst) {
                return Err("bot blocked".into());
            }
            options.report(3, 3);
            Ok(FanoutReport::from_counts(3, 3))
        }
    }

    #[derive(Default)]
    struct LastSent(Mutex<Option<DateTime<Utc>>>);

    #[async_trait]
    impl CooldownStore for LastSent {
        async fn last_notification(&self) -> std::result::Result<Option<DateTime<Utc>>, StoreError> {
            Ok(*self.0.lock().unwrap())
        }

        async fn compare_and_set(
            &self,
            expected: Option<DateTime<Utc>>,
            new: Option<DateTime<Utc>>,
        ) -> std::result::Result<bool, StoreError> {
            let mut slot = self.0.lock().unwrap();
            if *slot != expected {
                return Ok(false);
            }
            *slot = new;
            Ok(true)
        }
    }

    fn community() -> CommunityId {
        CommunityId::try_from("04054985").unwrap()
    }

    fn refresh(
        dispatcher: Arc<TaskDispatcher<ScriptedBroker>>,
        repo: Arc<Repo>,
    ) -> RegistryRefreshBuilder<ScriptedBroker, Arc<Repo>, Communities> {
        RegistryRefresh::builder(RegistryKind::Debtor, dispatcher, repo, Communities(&["04054985"]))
    }

    #[tokio::test]
    async fn successful_run_reports_counts_and_notifies() {
        let repo = Arc::new(Repo::default());
        let subscribers = Arc::new(Subscribers::default());
        let last_sent = Arc::new(LastSent::default());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let saga = refresh(scripted(happy_worker), Arc::clone(&repo))
            .notifier(subscribers.clone(), last_sent.clone())
            .progress(progress_tx)
            .community_name("Bucha")
            .build();

        let summary = saga.run(&community()).await.unwrap();

        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.history_rows, 2);
        assert_eq!(summary.import_date, NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());
        assert!(!summary.notification_skipped);
        assert!(matches!(summary.notification, NotificationOutcome::Sent(r) if r.notified_count == 3));
        assert!(last_sent.0.lock().unwrap().is_some());
        assert_eq!(progress_rx.try_recv().unwrap().percentage, 100.0);
    }

    #[tokio::test]
    async fn unknown_community_aborts_before_any_task() {
        let published = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&published);
        let dispatcher = scripted(move |envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            happy_worker(envelope)
        });
        let saga = refresh(dispatcher, Arc::new(Repo::default())).build();

        let err = saga
            .run(&CommunityId::try_from("99999999").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Workflow { step: WorkflowStep::Validate, .. }));
        assert_eq!(err.status_code(), 400);
        assert_eq!(published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn metadata_failure_names_the_step() {
        let dispatcher = scripted(|envelope| {
            Some(TaskReply::ok(
                envelope.correlation_id.clone(),
                json!({"success": false, "error": "registry maintenance"}),
            ))
        });
        let repo = Arc::new(Repo::default());
        let saga = refresh(dispatcher, Arc::clone(&repo)).build();

        let err = saga.run(&community()).await.unwrap_err();

        assert!(matches!(err, Error::Workflow { step: WorkflowStep::FetchMetadata, .. }));
        assert_eq!(err.public_message(), "registry maintenance");
        assert!(repo.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_dataset_aborts_without_touching_local_rows() {
        let dispatcher = scripted(|envelope| {
            let result = if envelope.name.as_str().ends_with("fetch_all") {
                json!({"success": true, "records": []})
            } else {
                json!({"success": true, "date": "2026-10-01T00:00:00Z"})
            };
            Some(TaskReply::ok(envelope.correlation_id.clone(), result))
        });
        let repo = Arc::new(Repo::default());
        repo.rows.lock().unwrap().push(Map::new());
        let saga = refresh(dispatcher, Arc::clone(&repo)).build();

        let err = saga.run(&community()).await.unwrap_err();

        assert!(matches!(err, Error::Workflow { step: WorkflowStep::FetchBulk, .. }));
        assert_eq!(repo.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_times_out_at_metadata() {
        let saga = refresh(scripted(|_| None), Arc::new(Repo::default()))
            .config(WorkflowConfig {
                metadata_timeout_secs: 1,
                ..WorkflowConfig::default()
            })
            .build();

        let err = saga.run(&community()).await.unwrap_err();

        assert_eq!(err.status_code(), 504);
        assert!(matches!(err, Error::Workflow { step: WorkflowStep::FetchMetadata, .. }));
    }

    #[tokio::test]
    async fn replace_failure_skips_history_and_notification() {
        let repo = Arc::new(Repo::default());
        repo.fail_replace.store(true, Ordering::SeqCst);
        let subscribers = Arc::new(Subscribers::default());
        let saga = refresh(scripted(happy_worker), Arc::clone(&repo))
            .notifier(subscribers.clone(), Arc::new(LastSent::default()))
            .build();

        let err = saga.run(&community()).await.unwrap_err();

        assert!(matches!(err, Error::Workflow { step: WorkflowStep::ReplaceLocal, .. }));
        assert_eq!(err.public_message(), "internal error");
        assert!(repo.history.lock().unwrap().is_empty());
        assert_eq!(subscribers.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fanout_failure_does_not_fail_the_run() {
        let subscribers = Arc::new(Subscribers::default());
        subscribers.fail.store(true, Ordering::SeqCst);
        let last_sent = Arc::new(LastSent::default());
        let saga = refresh(scripted(happy_worker), Arc::new(Repo::default()))
            .notifier(subscribers.clone(), last_sent.clone())
            .build();

        let summary = saga.run(&community()).await.unwrap();

        assert!(summary.notification_skipped);
        assert!(matches!(summary.notification, NotificationOutcome::Failed { .. }));
        assert!(last_sent.0.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn fanout_failure_releases_the_cooldown() {
        let subscribers = Arc::new(Subscribers::default());
        subscribers.fail.store(true, Ordering::SeqCst);
        let earlier = Utc::now() - chrono::Duration::days(40);
        let last_sent = Arc::new(LastSent(Mutex::new(Some(earlier))));
        let saga = refresh(scripted(happy_worker), Arc::new(Repo::default()))
            .notifier(subscribers.clone(), last_sent.clone())
            .build();

        saga.run(&community()).await.unwrap();
        assert_eq!(*last_sent.0.lock().unwrap(), Some(earlier));

        subscribers.fail.store(false, Ordering::SeqCst);
        let summary = saga.run(&community()).await.unwrap();
        assert!(matches!(summary.notification, NotificationOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn concurrent_registries_sharing_a_cooldown_notify_once() {
        let dispatcher = scripted(happy_worker);
        let subscribers = Arc::new(Subscribers::default());
        let last_sent = Arc::new(LastSent::default());
        let saga = |kind| {
            RegistryRefresh::builder(
                kind,
                Arc::clone(&dispatcher),
                Arc::new(Repo::default()),
                Communities(&["04054985"]),
            )
            .notifier(subscribers.clone(), last_sent.clone())
            .build()
        };
        let debtor = saga(RegistryKind::Debtor);
        let tax = saga(RegistryKind::Tax);
        let community = community();

        let (a, b) = tokio::join!(debtor.run(&community), tax.run(&community));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(subscribers.calls.load(Ordering::SeqCst), 1);
        assert_ne!(a.notification_skipped, b.notification_skipped);
        let skipped = if a.notification_skipped { a } else { b };
        assert!(matches!(
            skipped.notification,
            NotificationOutcome::Skipped { last_notification: Some(_) }
        ));
    }

    #[tokio::test]
    async fn name_source_is_read_on_every_run() {
        struct Rotating(Mutex<Vec<&'static str>>);

        #[async_trait]
        impl CommunityNameSource for Rotating {
            async fn community_name(&self) -> Result<String> {
                let name = self.0.lock().unwrap().remove(0);
                Ok(name.to_string())
            }
        }

        let subscribers = Arc::new(Subscribers::default());
        let saga = refresh(scripted(happy_worker), Arc::new(Repo::default()))
            .config(WorkflowConfig {
                notification_cooldown_days: 0,
                ..WorkflowConfig::default()
            })
            .community_name_source(Arc::new(Rotating(Mutex::new(vec!["Bucha", "Irpin"]))))
            .notifier(subscribers.clone(), Arc::new(LastSent::default()))
            .build();

        saga.run(&community()).await.unwrap();
        saga.run(&community()).await.unwrap();

        let texts = subscribers.texts.lock().unwrap();
        assert!(texts[0].contains("<b>Bucha</b>"));
        assert!(texts[1].contains("<b>Irpin</b>"));
    }

    #[tokio::test]
    async fn failing_name_source_falls_back_to_default() {
        struct Broken;

        #[async_trait]
        impl CommunityNameSource for Broken {
            async fn community_name(&self) -> Result<String> {
                Err(Error::Cache("settings table locked".into()))
            }
        }

        let subscribers = Arc::new(Subscribers::default());
        let saga = refresh(scripted(happy_worker), Arc::new(Repo::default()))
            .community_name_source(Arc::new(Broken))
            .notifier(subscribers.clone(), Arc::new(LastSent::default()))
            .build();

        let summary = saga.run(&community()).await.unwrap();

        assert!(matches!(summary.notification, NotificationOutcome::Sent(_)));
        assert!(subscribers.texts.lock().unwrap()[0].contains("<b>Community</b>"));
    }

    #[tokio::test]
    async fn concurrent_run_for_same_community_is_busy() {
        let saga = refresh(scripted(happy_worker), Arc::new(Repo::default())).build();
        let _slot = saga.claim(&community()).unwrap();

        let err = saga.run(&community()).await.unwrap_err();
        assert!(matches!(err, Error::WorkflowBusy(_)));
        assert_eq!(err.status_code(), 409);

        drop(_slot);
        assert!(saga.run(&community()).await.is_ok());
    }

    #[test]
    fn reference_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 10, 1);
        assert_eq!(parse_reference_date("2026-10-01"), expected);
        assert_eq!(parse_reference_date("2026-10-01T08:30:00+03:00"), expected);
        assert_eq!(parse_reference_date("01.10.2026"), expected);
        assert_eq!(parse_reference_date("yesterday"), None);
    }

    #[test]
    fn summary_serializes_notification_status() {
        let outcome = serde_json::to_value(NotificationOutcome::Skipped {
            last_notification: None,
        })
        .unwrap();
        assert_eq!(outcome["status"], "skipped");
        assert_eq!(RegistryKind::Tax.bulk_task().as_str(), "tax.fetch_all");
    }
}

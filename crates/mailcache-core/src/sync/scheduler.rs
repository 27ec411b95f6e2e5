//! Background sync loops, one per account.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::metrics::SyncMetrics;
use super::online::OnlineStatus;
use super::remote::{AccountGrant, RemoteError, RemoteProvider};
use super::replay::{ReplayReport, RetryPolicy, drain_queue};
use crate::config::{CacheSettings, MIN_SYNC_INTERVAL};
use crate::manager::{AccountCache, CacheManager};
use crate::store::{SyncResource, SyncState};
use crate::{Error, Result};

/// Default time between sync cycles.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default bound on one sync cycle.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Tuning for the sync loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Time between cycles. Anything below [`MIN_SYNC_INTERVAL`] is raised.
    pub interval: Duration,
    /// Bound on one whole cycle, queue replay included.
    pub cycle_timeout: Duration,
    /// Messages fetched per cycle.
    pub message_limit: u32,
    /// Events fetched per calendar per cycle.
    pub event_limit: u32,
    /// Contacts fetched per cycle.
    pub contact_limit: u32,
    /// Whether queued offline actions are replayed before each cycle.
    pub replay_enabled: bool,
    /// When replayed actions are given up on.
    pub retry: RetryPolicy,
    /// How far back an account's first email sync reaches.
    pub initial_window: Option<chrono::Duration>,
    /// Cached emails older than this are pruned after each cycle.
    pub retention: Option<chrono::Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            message_limit: 100,
            event_limit: 200,
            contact_limit: 500,
            replay_enabled: true,
            retry: RetryPolicy::default(),
            initial_window: None,
            retention: None,
        }
    }
}

impl SyncOptions {
    /// Options derived from user settings.
    #[must_use]
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            interval: settings.sync_interval(),
            replay_enabled: settings.offline_queue_enabled,
            retry: RetryPolicy {
                max_attempts: settings.max_action_attempts,
            },
            initial_window: Some(chrono::Duration::days(i64::from(
                settings.initial_sync_days.max(1),
            ))),
            retention: Some(settings.ttl()),
            ..Self::default()
        }
    }

    /// The interval actually used, never below [`MIN_SYNC_INTERVAL`].
    #[must_use]
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_SYNC_INTERVAL)
    }
}

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No remote provider is configured.
    NoRemote,
    /// The provider is known to be unreachable.
    Offline,
    /// Another cycle for the same account is still running.
    AlreadySyncing,
}

/// Outcome of one sync cycle for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Account email.
    pub email: String,
    /// Set when the cycle short-circuited.
    pub skipped: Option<SkipReason>,
    /// Resources written, with their item counts.
    pub synced: Vec<(SyncResource, usize)>,
    /// Resources whose sync failed.
    pub failed: Vec<SyncResource>,
    /// Queue replay outcome, if the queue was drained.
    pub replay: Option<ReplayReport>,
    /// Cached emails pruned for age.
    pub pruned: u64,
    /// Attachments evicted to stay under the size limit.
    pub evicted_attachments: u64,
    /// Why the cycle was abandoned part way, if it was.
    pub aborted: Option<String>,
}

impl SyncReport {
    fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            ..Self::default()
        }
    }

    /// Item count written for `resource`, if it synced.
    #[must_use]
    pub fn synced_count(&self, resource: SyncResource) -> Option<usize> {
        self.synced
            .iter()
            .find(|(r, _)| *r == resource)
            .map(|(_, n)| *n)
    }
}

/// Failure of one resource step.
enum StepError {
    Remote(RemoteError),
    Cache(Error),
}

impl From<Error> for StepError {
    fn from(e: Error) -> Self {
        Self::Cache(e)
    }
}

type StepResult = std::result::Result<usize, StepError>;

/// Marks an account as syncing until dropped.
struct CycleGuard<'a> {
    syncing: &'a std::sync::Mutex<HashSet<String>>,
    email: String,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.syncing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.email);
    }
}

/// State shared by every account loop.
struct Worker {
    manager: Arc<CacheManager>,
    remote: Option<Arc<dyn RemoteProvider>>,
    online: Arc<OnlineStatus>,
    metrics: Arc<SyncMetrics>,
    options: SyncOptions,
    /// Accounts with a cycle in flight.
    syncing: std::sync::Mutex<HashSet<String>>,
}

impl Worker {
    /// Claim the account for one cycle, or `None` if a cycle already runs.
    fn begin_cycle(&self, email: &str) -> Option<CycleGuard<'_>> {
        let mut syncing = self
            .syncing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !syncing.insert(email.to_string()) {
            return None;
        }
        Some(CycleGuard {
            syncing: &self.syncing,
            email: email.to_string(),
        })
    }

    async fn sync_account(&self, grant: &AccountGrant) -> SyncReport {
        let mut report = SyncReport::new(&grant.email);

        let Some(remote) = self.remote.clone() else {
            report.skipped = Some(SkipReason::NoRemote);
            self.metrics.record_skipped();
            return report;
        };
        if !self.online.is_online() {
            debug!("Skipping sync of {}: offline", grant.email);
            report.skipped = Some(SkipReason::Offline);
            self.metrics.record_skipped();
            return report;
        }
        let Some(_cycle) = self.begin_cycle(&grant.email) else {
            debug!("Skipping sync of {}: a cycle is already running", grant.email);
            report.skipped = Some(SkipReason::AlreadySyncing);
            self.metrics.record_skipped();
            return report;
        };

        self.metrics.record_cycle();
        debug!("Sync cycle started for {}", grant.email);

        let cycle = self.run_cycle(remote.as_ref(), grant, &mut report);
        match tokio::time::timeout(self.options.cycle_timeout, cycle).await {
            Ok(Ok(())) => {
                debug!("Sync cycle finished for {}", grant.email);
            }
            Ok(Err(e)) => {
                warn!("Sync of {} abandoned: {}", grant.email, e);
                report.aborted = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    "Sync of {} timed out after {:?}",
                    grant.email, self.options.cycle_timeout
                );
                self.metrics.record_failure();
                self.online.set_online(false);
                report.aborted = Some(RemoteError::Timeout.to_string());
            }
        }
        report
    }

    /// One cycle. Errors mean the cache became unusable.
    async fn run_cycle(
        &self,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
        report: &mut SyncReport,
    ) -> Result<()> {
        let cache = self.manager.account(&grant.email).await?;

        if self.options.replay_enabled {
            match self.replay(&cache, remote, grant).await {
                Ok(replay) => report.replay = Some(replay),
                Err(e) if e.is_cache_unavailable() => return Err(e),
                Err(e) => warn!("Offline queue replay for {} failed: {}", grant.email, e),
            }
        }

        for resource in SyncResource::ALL {
            let step = match resource {
                SyncResource::Emails => self.sync_emails(&cache, remote, grant).await,
                SyncResource::Folders => self.sync_folders(&cache, remote, grant).await,
                SyncResource::Events => self.sync_events(&cache, remote, grant).await,
                SyncResource::Contacts => self.sync_contacts(&cache, remote, grant).await,
            };

            match step {
                Ok(count) => {
                    self.metrics.record_items(count);
                    report.synced.push((resource, count));
                    if resource == SyncResource::Emails {
                        self.online.set_online(true);
                    }
                }
                Err(StepError::Cache(e)) if e.is_cache_unavailable() => return Err(e),
                Err(StepError::Cache(e)) => {
                    warn!("Caching {} for {} failed: {}", resource, grant.email, e);
                    self.metrics.record_failure();
                    report.failed.push(resource);
                }
                Err(StepError::Remote(e)) => {
                    warn!("Fetching {} for {} failed: {}", resource, grant.email, e);
                    self.metrics.record_failure();
                    report.failed.push(resource);
                    if resource == SyncResource::Emails {
                        self.online.set_online(false);
                        return Ok(());
                    }
                }
            }
        }

        if let Some(retention) = self.options.retention {
            match cache.emails().prune_older_than(Utc::now() - retention).await {
                Ok(pruned) => report.pruned = pruned,
                Err(e) if e.is_cache_unavailable() => return Err(e),
                Err(e) => warn!("Pruning {} failed: {}", grant.email, e),
            }
        }

        match cache.attachments().prune().await {
            Ok(evicted) => report.evicted_attachments = evicted,
            Err(e) if e.is_cache_unavailable() => return Err(e),
            Err(e) => warn!("Pruning attachments of {} failed: {}", grant.email, e),
        }
        Ok(())
    }

    async fn replay(
        &self,
        cache: &AccountCache,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
    ) -> Result<ReplayReport> {
        drain_queue(
            cache,
            remote,
            &grant.grant_id,
            self.options.retry,
            &self.metrics,
        )
        .await
    }

    async fn sync_emails(
        &self,
        cache: &AccountCache,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
    ) -> StepResult {
        let first_sync = cache
            .sync_state()
            .get(SyncResource::Emails.as_str())
            .await?
            .is_none();

        let mut messages = remote
            .get_messages(&grant.grant_id, self.options.message_limit)
            .await
            .map_err(StepError::Remote)?;

        if first_sync && let Some(window) = self.options.initial_window {
            let since = Utc::now() - window;
            messages.retain(|m| m.date >= since);
        }

        cache.emails().put_batch(&messages).await?;
        cache
            .sync_state()
            .set(&SyncState::now(SyncResource::Emails))
            .await?;
        Ok(messages.len())
    }

    async fn sync_folders(
        &self,
        cache: &AccountCache,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
    ) -> StepResult {
        let folders = remote
            .get_folders(&grant.grant_id)
            .await
            .map_err(StepError::Remote)?;

        cache.folders().put_batch(&folders).await?;
        cache
            .sync_state()
            .set(&SyncState::now(SyncResource::Folders))
            .await?;
        Ok(folders.len())
    }

    /// Events of every calendar. A failing calendar is skipped, and the
    /// checkpoint only advances when all of them synced.
    async fn sync_events(
        &self,
        cache: &AccountCache,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
    ) -> StepResult {
        let calendars = remote
            .get_calendars(&grant.grant_id)
            .await
            .map_err(StepError::Remote)?;

        let mut count = 0;
        let mut failure = None;
        for calendar in &calendars {
            let mut events = match remote
                .get_events(&grant.grant_id, &calendar.id, self.options.event_limit)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    debug!("Skipping calendar {}: {}", calendar.id, e);
                    failure = Some(e);
                    continue;
                }
            };

            for event in &mut events {
                if event.calendar_id.is_empty() {
                    event.calendar_id.clone_from(&calendar.id);
                }
            }
            cache.events().put_batch(&events).await?;
            count += events.len();
        }

        if let Some(e) = failure {
            return Err(StepError::Remote(e));
        }
        cache
            .sync_state()
            .set(&SyncState::now(SyncResource::Events))
            .await?;
        Ok(count)
    }

    async fn sync_contacts(
        &self,
        cache: &AccountCache,
        remote: &dyn RemoteProvider,
        grant: &AccountGrant,
    ) -> StepResult {
        let contacts = remote
            .get_contacts(&grant.grant_id, self.options.contact_limit)
            .await
            .map_err(StepError::Remote)?;

        cache.contacts().put_batch(&contacts).await?;
        cache
            .sync_state()
            .set(&SyncState::now(SyncResource::Contacts))
            .await?;
        Ok(contacts.len())
    }

    async fn replay_account(&self, grant: &AccountGrant) -> Option<ReplayReport> {
        let remote = self.remote.clone()?;
        if !self.options.replay_enabled {
            return None;
        }

        let result = match self.manager.account(&grant.email).await {
            Ok(cache) => self.replay(&cache, remote.as_ref(), grant).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Offline queue replay for {} failed: {}", grant.email, e);
                None
            }
        }
    }
}

async fn run_loop(worker: Arc<Worker>, grant: AccountGrant, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(worker.options.effective_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Background sync started for {} every {:?}",
        grant.email,
        worker.options.effective_interval()
    );

    loop {
        if *stop.borrow_and_update() {
            break;
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = stop.changed() => {
                debug!("Sync of {} interrupted by shutdown", grant.email);
                break;
            }
            _ = worker.sync_account(&grant) => {}
        }
    }

    info!("Background sync stopped for {}", grant.email);
}

/// Runs one sync loop per account and stops them together.
///
/// Connectivity and counters are shared contexts passed in by the caller, so
/// request handlers can observe and flip the same [`OnlineStatus`].
pub struct SyncScheduler {
    worker: Arc<Worker>,
    stop: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    grants: Mutex<HashMap<String, AccountGrant>>,
}

impl SyncScheduler {
    /// Creates a scheduler. With no `remote` every cycle is skipped.
    #[must_use]
    pub fn new(
        manager: Arc<CacheManager>,
        remote: Option<Arc<dyn RemoteProvider>>,
        online: Arc<OnlineStatus>,
        metrics: Arc<SyncMetrics>,
        options: SyncOptions,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            worker: Arc::new(Worker {
                manager,
                remote,
                online,
                metrics,
                options,
                syncing: std::sync::Mutex::new(HashSet::new()),
            }),
            stop,
            tasks: Mutex::new(JoinSet::new()),
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// Shared connectivity flag.
    #[must_use]
    pub fn online(&self) -> &Arc<OnlineStatus> {
        &self.worker.online
    }

    /// Shared counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.worker.metrics
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.worker.options
    }

    /// Start the loop of one account. The first cycle runs immediately.
    ///
    /// Returns false if the account already has a loop or the scheduler has
    /// been shut down.
    pub async fn start(&self, grant: AccountGrant) -> bool {
        if *self.stop.borrow() {
            return false;
        }

        let mut grants = self.grants.lock().await;
        if grants.contains_key(&grant.email) {
            return false;
        }
        grants.insert(grant.email.clone(), grant.clone());

        let worker = Arc::clone(&self.worker);
        let stop = self.stop.subscribe();
        self.tasks
            .lock()
            .await
            .spawn(run_loop(worker, grant, stop));
        true
    }

    /// Start loops for several accounts. Returns how many were started.
    pub async fn start_all(&self, grants: impl IntoIterator<Item = AccountGrant>) -> usize {
        let mut started = 0;
        for grant in grants {
            if self.start(grant).await {
                started += 1;
            }
        }
        started
    }

    /// Accounts with a running loop, sorted by email.
    pub async fn accounts(&self) -> Vec<AccountGrant> {
        let mut grants: Vec<_> = self.grants.lock().await.values().cloned().collect();
        grants.sort_by(|a, b| a.email.cmp(&b.email));
        grants
    }

    /// Run one cycle for an account right away.
    ///
    /// Skipped with [`SkipReason::AlreadySyncing`] while the account's loop
    /// (or another caller) is mid-cycle.
    pub async fn sync_now(&self, grant: &AccountGrant) -> SyncReport {
        self.worker.sync_account(grant).await
    }

    /// Set connectivity. Coming back online drains every started account's
    /// offline queue.
    pub async fn set_online(&self, online: bool) -> Vec<ReplayReport> {
        if !self.worker.online.set_online(online) || !online {
            return Vec::new();
        }
        self.replay_all().await
    }

    /// Drain the offline queue of every started account.
    pub async fn replay_all(&self) -> Vec<ReplayReport> {
        let grants = self.accounts().await;
        let mut reports = Vec::with_capacity(grants.len());
        for grant in &grants {
            if let Some(report) = self.worker.replay_account(grant).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Signal every loop to stop and wait for them, interrupting in-flight
    /// cycles.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Sync task failed: {}", e);
            }
        }
        info!("Background sync stopped");
    }
}

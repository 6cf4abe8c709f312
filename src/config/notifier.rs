//! Config Change Notifier
//!
//! Holds client subscriptions and delivers change notifications for the
//! (application, profile, label) triple each one watches.
//!
//! Every subscription owns an ordered queue. The head of the queue is handed
//! out again and again until the client acknowledges it, which gives
//! at-least-once delivery without reordering. Subscriptions are independent
//! of each other, so a slow client only delays itself.

use super::snapshot::{ConfigChange, ConfigKey};
use crate::domain::clock::SharedClock;
use crate::domain::ports::NotificationSink;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the notifier
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Subscriptions with no client activity for this long are removed
    pub subscription_timeout: Duration,
    /// How often idle subscriptions are checked
    pub expiry_interval: Duration,
    /// First retry delay for push-mode delivery
    pub push_initial_backoff: Duration,
    /// Retry delay cap for push-mode delivery
    pub push_max_backoff: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            subscription_timeout: Duration::from_secs(300),
            expiry_interval: Duration::from_secs(30),
            push_initial_backoff: Duration::from_millis(500),
            push_max_backoff: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

struct SubscriptionState {
    last_seen_version: u64,
    queue: VecDeque<ConfigChange>,
    last_activity: DateTime<Utc>,
}

struct Subscription {
    id: u64,
    client_id: String,
    key: ConfigKey,
    state: Mutex<SubscriptionState>,
    notify: Notify,
    waiters: AtomicUsize,
    cancelled: AtomicBool,
    clock: SharedClock,
}

impl Subscription {
    fn touch(&self) {
        self.state.lock().last_activity = self.clock.now();
    }

    fn cancel(&self) -> bool {
        let was = self.cancelled.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        !was
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queue a change unless already seen or queued
    fn enqueue(&self, change: ConfigChange) -> bool {
        let mut state = self.state.lock();
        let tail = state
            .queue
            .back()
            .map(|c| c.version)
            .unwrap_or(state.last_seen_version);
        if change.version <= tail {
            return false;
        }
        state.queue.push_back(change);
        drop(state);
        self.notify.notify_waiters();
        true
    }
}

/// Public view of a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: u64,
    pub client_id: String,
    pub application: String,
    pub profile: String,
    pub label: String,
    pub last_seen_version: u64,
    pub pending: usize,
    pub last_activity: DateTime<Utc>,
}

/// Decrements the waiter count even if the wait is dropped
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Client side of a subscription
///
/// Dropping the handle removes the subscription.
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    notifier: Weak<ConfigChangeNotifier>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn client_id(&self) -> &str {
        &self.subscription.client_id
    }

    pub fn key(&self) -> &ConfigKey {
        &self.subscription.key
    }

    pub fn last_seen_version(&self) -> u64 {
        self.subscription.state.lock().last_seen_version
    }

    /// Number of undelivered or unacknowledged changes
    pub fn pending(&self) -> usize {
        self.subscription.state.lock().queue.len()
    }

    /// Oldest unacknowledged change, if any, without waiting
    pub fn try_next(&self) -> Option<ConfigChange> {
        if self.is_cancelled() {
            return None;
        }
        let mut state = self.subscription.state.lock();
        state.last_activity = self.subscription.clock.now();
        state.queue.front().cloned()
    }

    /// Wait for the oldest unacknowledged change
    ///
    /// Returns the same change until it is acknowledged. Returns `None` once
    /// the subscription is cancelled or expired.
    pub async fn next(&self) -> Option<ConfigChange> {
        let subscription = &self.subscription;
        loop {
            let notified = subscription.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(change) = self.try_next() {
                return Some(change);
            }
            if self.is_cancelled() {
                return None;
            }

            let _guard = WaitGuard::new(&subscription.waiters);
            notified.await;
            subscription.touch();
        }
    }

    /// Acknowledge every change up to and including `version`
    pub fn ack(&self, version: u64) {
        let mut state = self.subscription.state.lock();
        while state.queue.front().map(|c| c.version <= version).unwrap_or(false) {
            state.queue.pop_front();
        }
        if version > state.last_seen_version {
            state.last_seen_version = version;
        }
        state.last_activity = self.subscription.clock.now();
        drop(state);

        if let Some(notifier) = self.notifier.upgrade() {
            notifier.stats.acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cancel(&self) {
        if self.subscription.cancel() {
            debug!(subscription_id = self.id(), client_id = %self.client_id(), "Subscription cancelled");
        }
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.subscriptions.remove(&self.subscription.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.subscription.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.subscription.id)
            .field("client_id", &self.subscription.client_id)
            .field("key", &self.subscription.key)
            .finish()
    }
}

// =============================================================================
// Notifier
// =============================================================================

#[derive(Debug, Default)]
struct NotifierStats {
    subscribed: AtomicU64,
    enqueued: AtomicU64,
    acked: AtomicU64,
    expired: AtomicU64,
}

/// Snapshot of notifier counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierStatsSnapshot {
    pub active_subscriptions: usize,
    pub subscribed: u64,
    pub enqueued: u64,
    pub acked: u64,
    pub expired: u64,
}

/// Registry of config subscriptions
pub struct ConfigChangeNotifier {
    config: NotifierConfig,
    subscriptions: DashMap<u64, Arc<Subscription>>,
    next_id: AtomicU64,
    clock: SharedClock,
    stats: NotifierStats,
}

impl ConfigChangeNotifier {
    pub fn new(config: NotifierConfig, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock,
            stats: NotifierStats::default(),
        })
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Register a subscription with an initial backlog
    ///
    /// The backlog must be ordered and contain only versions above
    /// `last_seen_version`. Callers serialize this against publishes on the
    /// same key so nothing is missed or duplicated between the two.
    pub fn subscribe(
        self: &Arc<Self>,
        client_id: impl Into<String>,
        key: ConfigKey,
        last_seen_version: u64,
        backlog: Vec<ConfigChange>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            client_id: client_id.into(),
            key,
            state: Mutex::new(SubscriptionState {
                last_seen_version,
                queue: VecDeque::new(),
                last_activity: self.clock.now(),
            }),
            notify: Notify::new(),
            waiters: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            clock: self.clock.clone(),
        });

        let mut enqueued = 0;
        for change in backlog {
            if subscription.enqueue(change) {
                enqueued += 1;
            }
        }
        self.stats.enqueued.fetch_add(enqueued, Ordering::Relaxed);
        self.stats.subscribed.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, subscription.clone());

        debug!(
            subscription_id = id,
            client_id = %subscription.client_id,
            key = %subscription.key,
            last_seen_version,
            backlog = enqueued,
            "Subscription registered"
        );

        SubscriptionHandle {
            subscription,
            notifier: Arc::downgrade(self),
        }
    }

    /// Fan a change out to every matching subscription
    ///
    /// Never fails; returns how many subscriptions queued the change.
    pub fn notify(&self, change: &ConfigChange) -> usize {
        let mut delivered = 0;
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if subscription.is_cancelled() {
                continue;
            }
            let key = &subscription.key;
            if key.application != change.application
                || key.profile != change.profile
                || key.label != change.label
            {
                continue;
            }
            if subscription.enqueue(change.clone()) {
                delivered += 1;
            }
        }
        self.stats.enqueued.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Remove subscriptions idle past the timeout
    ///
    /// A subscription with a client currently waiting on it is never idle.
    pub fn expire_idle(&self) -> usize {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.subscription_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let idle: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                let subscription = entry.value();
                subscription.waiters.load(Ordering::SeqCst) == 0
                    && now.signed_duration_since(subscription.state.lock().last_activity) > timeout
            })
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in idle {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                subscription.cancel();
                expired += 1;
                info!(
                    subscription_id = id,
                    client_id = %subscription.client_id,
                    key = %subscription.key,
                    "Subscription expired after inactivity"
                );
            }
        }
        self.stats.expired.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Periodically expire idle subscriptions until cancelled
    pub async fn run_expiry(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.expiry_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.expire_idle();
                }
            }
        }
        debug!("Subscription expiry loop stopped");
    }

    /// Cancel every subscription
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                subscription.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .subscriptions
            .iter()
            .map(|entry| {
                let s = entry.value();
                let state = s.state.lock();
                SubscriptionInfo {
                    id: s.id,
                    client_id: s.client_id.clone(),
                    application: s.key.application.clone(),
                    profile: s.key.profile.clone(),
                    label: s.key.label.clone(),
                    last_seen_version: state.last_seen_version,
                    pending: state.queue.len(),
                    last_activity: state.last_activity,
                }
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub fn stats(&self) -> NotifierStatsSnapshot {
        NotifierStatsSnapshot {
            active_subscriptions: self.subscriptions.len(),
            subscribed: self.stats.subscribed.load(Ordering::Relaxed),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Push Delivery
// =============================================================================

/// Drive a subscription into a sink
///
/// Each change is retried with backoff until the sink accepts it, and only
/// then acknowledged. Ends when the subscription is cancelled or expires,
/// when `token` is cancelled, or when the sink refuses a change with a
/// non-retryable error, which also cancels the subscription.
pub fn spawn_push_delivery(
    handle: SubscriptionHandle,
    sink: Arc<dyn NotificationSink>,
    config: &NotifierConfig,
    token: CancellationToken,
) -> JoinHandle<()> {
    let initial_backoff = config.push_initial_backoff;
    let max_backoff = config.push_max_backoff;

    tokio::spawn(async move {
        info!(subscription_id = handle.id(), target = %sink.target(), key = %handle.key(), "Push delivery started");

        'changes: loop {
            let change = tokio::select! {
                _ = token.cancelled() => break,
                change = handle.next() => match change {
                    Some(change) => change,
                    None => break,
                },
            };

            let mut backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(initial_backoff)
                .with_max_interval(max_backoff)
                .with_max_elapsed_time(None)
                .build();
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                match sink.deliver(&change).await {
                    Ok(()) => {
                        handle.ack(change.version);
                        debug!(target = %sink.target(), version = change.version, attempt, "Change delivered");
                        break;
                    }
                    Err(e) if !e.is_retryable() => {
                        warn!(
                            target = %sink.target(),
                            version = change.version,
                            attempt,
                            error = %e,
                            "Sink refused change permanently, cancelling subscription"
                        );
                        handle.cancel();
                        break 'changes;
                    }
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(max_backoff);
                        warn!(
                            target = %sink.target(),
                            version = change.version,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Change delivery failed"
                        );
                        tokio::select! {
                            _ = token.cancelled() => break 'changes,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if handle.is_cancelled() {
                            break 'changes;
                        }
                    }
                }
            }
        }

        info!(subscription_id = handle.id(), target = %sink.target(), "Push delivery stopped");
    })
}

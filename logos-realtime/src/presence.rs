//! Workspace presence: who is online, away or gone.
//!
//! One [`PresenceTracker`] is one local client's view of one workspace.
//!
//! ## Timers
//!
//! ```text
//! start()
//!   │
//!   ├── heartbeat  every heartbeat_interval ── local user ONLINE, lastSeen = now
//!   │
//!   └── sweep      every heartbeat_interval ── remote lastSeen older than
//!                                              inactivity_timeout → OFFLINE
//! ```
//!
//! Both timers share one period, so a silent peer is marked offline at most
//! `heartbeat_interval + inactivity_timeout` after its last update.
//!
//! The local user's record is only written by the tracker's own lifecycle
//! calls. Remote records are written by [`PresenceTracker::update_presence`]
//! and by the sweep, and dropped (reported offline) on a workspace switch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::event_bus::{Event, EventBus, Subscription};
use crate::message::now_millis;

/// A user's status within a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Presence wire payload and table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, status: PresenceStatus, workspace_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            last_seen: now_millis(),
            workspace_id: workspace_id.into(),
            meta: None,
        }
    }

    /// Whether `last_seen` is more than `timeout` before `now_ms`.
    pub fn is_stale(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// Tracker timing configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Period of both the local heartbeat and the staleness sweep.
    pub heartbeat_interval: Duration,
    /// Age after which a remote record is considered gone.
    pub inactivity_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEventKind {
    Changed,
}

/// Emitted for every record mutation, local or remote.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    pub record: PresenceRecord,
    pub previous: Option<PresenceStatus>,
    /// Whether the record belongs to the local user.
    pub local: bool,
}

impl Event for PresenceChange {
    type Kind = PresenceEventKind;

    fn kind(&self) -> PresenceEventKind {
        PresenceEventKind::Changed
    }
}

struct TrackerState {
    workspace_id: String,
    presences: HashMap<String, PresenceRecord>,
    heartbeat: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
}

impl TrackerState {
    fn is_running(&self) -> bool {
        self.heartbeat.is_some()
    }

    fn cancel_timers(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = self.sweep.take() {
            handle.abort();
        }
    }
}

struct TrackerInner {
    local_user_id: String,
    config: PresenceConfig,
    state: Mutex<TrackerState>,
    bus: EventBus<PresenceChange>,
}

/// Per-workspace membership table with heartbeat and inactivity eviction.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    pub fn new(
        local_user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                local_user_id: local_user_id.into(),
                config,
                state: Mutex::new(TrackerState {
                    workspace_id: workspace_id.into(),
                    presences: HashMap::new(),
                    heartbeat: None,
                    sweep: None,
                }),
                bus: EventBus::new(),
            }),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user_id
    }

    pub fn workspace_id(&self) -> String {
        self.inner.state.lock().workspace_id.clone()
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    /// Whether the heartbeat and sweep timers are scheduled.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().is_running()
    }

    /// Mark the local user online and start the heartbeat and sweep timers.
    ///
    /// Restarting an already running tracker replaces its timers. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        let period = self.inner.config.heartbeat_interval;
        let heartbeat = spawn_ticker(Arc::downgrade(&self.inner), period, |tracker| {
            tracker.heartbeat();
        });
        let sweep = spawn_ticker(Arc::downgrade(&self.inner), period, |tracker| {
            let evicted = tracker.sweep_inactive();
            if !evicted.is_empty() {
                log::debug!("Presence sweep marked {} user(s) offline", evicted.len());
            }
        });

        {
            let mut state = self.inner.state.lock();
            state.cancel_timers();
            state.heartbeat = Some(heartbeat);
            state.sweep = Some(sweep);
        }

        self.mark_local(PresenceStatus::Online, false);
        log::debug!("Presence tracking started for {}", self.inner.local_user_id);
    }

    /// Cancel both timers and mark the local user offline.
    pub fn stop(&self) {
        self.inner.state.lock().cancel_timers();
        self.mark_local(PresenceStatus::Offline, false);
    }

    /// Record a remote user's presence.
    ///
    /// Returns `false` (and changes nothing) for the local user, whose record
    /// is owned by the tracker itself.
    pub fn update_presence(&self, user_id: &str, mut presence: PresenceRecord) -> bool {
        if user_id == self.inner.local_user_id {
            log::debug!("Ignoring external presence update for local user {user_id}");
            return false;
        }
        presence.user_id = user_id.to_string();

        let previous = {
            let mut state = self.inner.state.lock();
            state
                .presences
                .insert(user_id.to_string(), presence.clone())
                .map(|old| old.status)
        };

        self.notify(PresenceChange {
            record: presence,
            previous,
            local: false,
        });
        true
    }

    pub fn get_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        self.inner.state.lock().presences.get(user_id).cloned()
    }

    pub fn get_all_presences(&self) -> Vec<PresenceRecord> {
        self.inner.state.lock().presences.values().cloned().collect()
    }

    /// Users currently marked online, excluding the local user.
    pub fn online_users(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .presences
            .values()
            .filter(|p| p.status == PresenceStatus::Online && p.user_id != self.inner.local_user_id)
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Subscribe to every presence mutation.
    pub fn on_presence_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        self.inner.bus.on(PresenceEventKind::Changed, callback)
    }

    pub fn set_away(&self) {
        self.mark_local(PresenceStatus::Away, false);
    }

    pub fn set_online(&self) {
        self.mark_local(PresenceStatus::Online, false);
    }

    /// Move the local user to another workspace.
    ///
    /// Remote records from the previous workspace are dropped, each reported
    /// as an offline change. The local record is re-announced under the new id.
    pub fn update_workspace(&self, workspace_id: impl Into<String>) {
        let workspace_id = workspace_id.into();
        let (dropped, status) = {
            let mut state = self.inner.state.lock();
            if state.workspace_id == workspace_id {
                return;
            }
            state.workspace_id = workspace_id.clone();
            let local = self.inner.local_user_id.as_str();
            let stale: Vec<String> = state
                .presences
                .iter()
                .filter(|(id, record)| id.as_str() != local && record.workspace_id != workspace_id)
                .map(|(id, _)| id.clone())
                .collect();
            let dropped: Vec<PresenceChange> = stale
                .iter()
                .filter_map(|id| state.presences.remove(id))
                .map(|mut record| {
                    let previous = record.status;
                    record.status = PresenceStatus::Offline;
                    PresenceChange {
                        record,
                        previous: Some(previous),
                        local: false,
                    }
                })
                .collect();
            let status = match state.presences.get(local) {
                Some(record) => Some(record.status),
                None if state.is_running() => Some(PresenceStatus::Online),
                None => None,
            };
            (dropped, status)
        };

        for change in dropped {
            self.notify(change);
        }
        if let Some(status) = status {
            self.mark_local(status, false);
        }
    }

    /// Mark remote users whose `last_seen` exceeds the inactivity timeout as
    /// offline. Returns the ids that transitioned.
    ///
    /// Already-offline users are left untouched.
    pub fn sweep_inactive(&self) -> Vec<String> {
        let now = now_millis();
        let timeout = self.inner.config.inactivity_timeout;

        let changes: Vec<PresenceChange> = {
            let mut state = self.inner.state.lock();
            let local = self.inner.local_user_id.as_str();
            state
                .presences
                .iter_mut()
                .filter(|(id, record)| {
                    id.as_str() != local
                        && record.status != PresenceStatus::Offline
                        && record.is_stale(now, timeout)
                })
                .map(|(_, record)| {
                    let previous = record.status;
                    record.status = PresenceStatus::Offline;
                    PresenceChange {
                        record: record.clone(),
                        previous: Some(previous),
                        local: false,
                    }
                })
                .collect()
        };

        let evicted = changes.iter().map(|c| c.record.user_id.clone()).collect();
        for change in changes {
            self.notify(change);
        }
        evicted
    }

    /// Stop, forget every record and drop every listener.
    pub fn cleanup(&self) {
        self.stop();
        self.inner.state.lock().presences.clear();
        self.inner.bus.remove_all_listeners(None);
    }

    fn heartbeat(&self) {
        self.mark_local(PresenceStatus::Online, true);
    }

    fn mark_local(&self, status: PresenceStatus, only_if_running: bool) {
        let change = {
            let mut state = self.inner.state.lock();
            if only_if_running && !state.is_running() {
                return;
            }
            let local = self.inner.local_user_id.clone();
            let meta = state.presences.get(&local).and_then(|r| r.meta.clone());
            let record = PresenceRecord {
                user_id: local.clone(),
                status,
                last_seen: now_millis(),
                workspace_id: state.workspace_id.clone(),
                meta,
            };
            let previous = state.presences.insert(local, record.clone()).map(|r| r.status);
            PresenceChange {
                record,
                previous,
                local: true,
            }
        };
        self.notify(change);
    }

    fn notify(&self, change: PresenceChange) {
        self.inner.bus.emit(&change);
    }
}

fn spawn_ticker(
    tracker: Weak<TrackerInner>,
    period: Duration,
    tick: fn(&PresenceTracker),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = tracker.upgrade() else {
                break;
            };
            tick(&PresenceTracker { inner });
        }
    })
}

//! Push and pull orchestration.
//!
//! # Push
//!
//! A debounced change signal (or a manual call) drains the oplog oldest
//! first: entries for disabled plugins are marked synced without being
//! sent, the rest are encrypted and pushed in size- and count-bounded
//! batches, and marked synced only after the relay acknowledges them.
//!
//! # Pull
//!
//! On start, on every tick, and on demand, pages are fetched from the
//! persisted cursor. A page is decrypted in full before any record is
//! applied, and the cursor is saved after every applied page so a crash
//! resumes from the last complete page.
//!
//! Both directions are single-flight and share one backoff window.
//! Failures never propagate to callers; they land in
//! [`SyncState::last_error`](settingsync_storage::SyncState).

use crate::api_client::{new_trace_id, RelayClient};
use crate::backoff::Backoff;
use crate::collaborators::{Applier, ExclusionProvider, OplogStore};
use crate::config::SyncConfig;
use crate::crypto_provider::{build_aad, plugin_id_for, SyncCrypto};
use crate::debouncer::{cancelled, Debouncer};
use crate::device::DeviceProvider;
use crate::error::{CloudError, CloudResult};
use crate::key_manager::KeyObserver;
use crate::types::*;
use async_trait::async_trait;
use settingsync_storage::{now_millis, ChangeNotifier, OplogEntry, SyncState, SyncStateStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators for [`SyncManager`]. Missing ones surface as
/// configuration errors when the loop that needs them runs.
#[derive(Clone, Default)]
pub struct SyncDeps {
    pub relay: Option<Arc<dyn RelayClient>>,
    pub crypto: Option<Arc<dyn SyncCrypto>>,
    pub device: Option<Arc<dyn DeviceProvider>>,
    pub oplog: Option<Arc<dyn OplogStore>>,
    pub applier: Option<Arc<dyn Applier>>,
    pub exclusions: Option<Arc<dyn ExclusionProvider>>,
    pub notifier: Option<ChangeNotifier>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Pull,
    Snapshot,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Pull => "pull",
            Stream::Snapshot => "snapshot",
        }
    }
}

/// A decrypted record ready to apply.
struct Decoded {
    entity_type: String,
    plugin_id: String,
    key: String,
    op: Operation,
    value: String,
}

/// One start/stop cycle. Workers exit when `cancel` flips or is dropped.
struct Running {
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncManager {
    inner: Arc<Inner>,
    run: Mutex<Option<Running>>,
}

struct Inner {
    config: SyncConfig,
    deps: SyncDeps,
    state: SyncStateStore,
    backoff: Backoff,
    debouncer: Option<Debouncer>,
    push_mu: Mutex<()>,
    pull_mu: Mutex<()>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, state: SyncStateStore, deps: SyncDeps) -> Self {
        let config = config.normalized();
        let debouncer = deps
            .notifier
            .clone()
            .map(|n| Debouncer::new(n, config.debounce()));
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                state,
                backoff: Backoff::new(),
                debouncer,
                push_mu: Mutex::new(()),
                pull_mu: Mutex::new(()),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Spawns the pull ticker and, when a change notifier is wired in, the
    /// debounced push worker. A no-op if already running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.is_some() {
            debug!("sync manager already running");
            return;
        }
        let (cancel_tx, _) = watch::channel(false);

        let mut tasks = Vec::with_capacity(2);

        // Initial pull, then one per interval
        {
            let inner = self.inner.clone();
            let mut cancel = cancel_tx.subscribe();
            let pull_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                inner.pull(Some(&pull_cancel)).await;
                let period = inner.config.pull_interval();
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => break,
                        _ = ticker.tick() => inner.pull(Some(&pull_cancel)).await,
                    }
                }
                debug!("pull worker stopped");
            }));
        }

        if let Some(notifier) = &self.inner.deps.notifier {
            // Flush anything recorded while stopped
            notifier.notify();

            let inner = self.inner.clone();
            let mut cancel = cancel_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let Some(debouncer) = inner.debouncer.as_ref() else {
                    return;
                };
                while debouncer.settled(&mut cancel).await {
                    inner.push_pending(Some(&cancel)).await;
                }
                debug!("push worker stopped");
            }));
        }

        *run = Some(Running {
            cancel: cancel_tx,
            tasks,
        });
        info!(
            "sync manager started (pull every {}s, debounce {}ms)",
            self.inner.config.pull_interval_secs, self.inner.config.debounce_ms
        );
    }

    /// Cancels background work and waits for it to finish. In-flight relay
    /// calls complete; loops exit at their next batch or page boundary.
    pub async fn stop(&self) {
        // Held until the workers are joined so a racing start waits
        let mut run = self.run.lock().await;
        let Some(running) = run.take() else {
            return;
        };
        running.cancel.send_replace(true);

        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("sync task ended abnormally: {e}");
            }
        }
        if let Some(debouncer) = &self.inner.debouncer {
            debouncer.discard_pending().await;
        }
        info!("sync manager stopped");
    }

    /// Drains the oplog now. Failures are recorded, not returned.
    pub async fn push_pending(&self) {
        self.inner.push_pending(None).await;
    }

    /// Pulls from the persisted cursor now. Failures are recorded, not returned.
    pub async fn pull(&self) {
        self.inner.pull(None).await;
    }

    /// Discards the cursor and re-reads the full state from the relay's
    /// snapshot endpoint. Ignores the backoff window.
    pub async fn resync_from_snapshot(&self, reason: &str) {
        self.inner.resync_from_snapshot(reason).await;
    }

    pub fn state(&self) -> CloudResult<SyncState> {
        Ok(self.inner.state.load()?)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        // Workers hold their own handle to `inner`; tell them to exit.
        if let Some(running) = self.run.get_mut().take() {
            running.cancel.send_replace(true);
        }
    }
}

#[async_trait]
impl KeyObserver for SyncManager {
    async fn key_ready(&self, version: i32) {
        debug!(key_version = version, "key ready, starting sync");
        self.start().await;
    }

    async fn key_cleared(&self) {
        debug!("key cleared, stopping sync");
        self.stop().await;
    }
}

fn require<'a, T: ?Sized>(
    dep: &'a Option<Arc<T>>,
    what: &'static str,
) -> CloudResult<&'a Arc<T>> {
    dep.as_ref().ok_or(CloudError::NotConfigured(what))
}

impl Inner {
    fn disabled_plugins(&self) -> HashSet<String> {
        self.deps
            .exclusions
            .as_ref()
            .map(|e| e.disabled_plugin_ids().into_iter().collect())
            .unwrap_or_default()
    }

    fn in_backoff(&self) -> CloudResult<bool> {
        let state = self.state.load()?;
        Ok(state.is_backing_off(now_millis()))
    }

    // ── Push ──

    async fn push_pending(&self, cancel: Option<&watch::Receiver<bool>>) {
        let _guard = self.push_mu.lock().await;
        let trace_id = new_trace_id();
        if let Err(e) = self.push_inner(&trace_id, cancel).await {
            self.record_failure("push", &trace_id, &e);
        }
    }

    async fn push_inner(
        &self,
        trace_id: &str,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> CloudResult<()> {
        let relay = require(&self.deps.relay, "relay client")?;
        let crypto = require(&self.deps.crypto, "crypto provider")?;
        let device = require(&self.deps.device, "device provider")?;
        let oplog = require(&self.deps.oplog, "oplog store")?;

        if self.in_backoff()? {
            debug!(trace_id, "push skipped: backing off");
            return Ok(());
        }

        let load_limit = self.config.max_batch_count * 4;
        loop {
            if is_cancelled(cancel) {
                debug!(trace_id, "push cancelled");
                return Ok(());
            }

            let pending = oplog.load_pending(load_limit).await?;
            if pending.is_empty() {
                return Ok(());
            }
            let loaded = pending.len();

            let disabled = self.disabled_plugins();
            let (dropped, eligible): (Vec<OplogEntry>, Vec<OplogEntry>) = pending
                .into_iter()
                .partition(|e| {
                    e.entity_type == ENTITY_PLUGIN_SETTING && disabled.contains(&e.entity_id)
                });

            let mut dropped_marked = false;
            if !dropped.is_empty() {
                let ids: Vec<i64> = dropped.iter().map(|e| e.id).collect();
                match oplog.mark_synced(&ids).await {
                    Ok(()) => {
                        dropped_marked = true;
                        debug!(trace_id, "dropped {} changes for disabled plugins", ids.len());
                    }
                    Err(e) => warn!(trace_id, "failed to mark disabled-plugin changes synced: {e}"),
                }
            }

            if eligible.is_empty() {
                if dropped_marked {
                    continue;
                }
                return Ok(());
            }

            let (changes, ids) = self.build_batch(crypto.as_ref(), &eligible)?;
            let sent = ids.len();

            let req = PushRequest {
                device_id: device.device_id()?,
                changes,
            };
            let resp = relay.push(&req, trace_id).await?;

            oplog.mark_synced(&ids).await?;
            self.record_push_success(&resp)?;
            debug!(trace_id, "pushed {sent} changes ({} acknowledged)", resp.applied.len());

            if eligible.len() <= sent && loaded < load_limit {
                return Ok(());
            }
        }
    }

    /// Encrypts entries into one batch within the count and byte caps.
    /// The first entry is always taken, even when it alone exceeds the
    /// byte cap.
    fn build_batch(
        &self,
        crypto: &dyn SyncCrypto,
        eligible: &[OplogEntry],
    ) -> CloudResult<(Vec<Change>, Vec<i64>)> {
        let mut changes = Vec::new();
        let mut ids = Vec::new();
        let mut total_bytes = 0usize;

        for entry in eligible {
            let change = encrypt_entry(crypto, entry)?;
            let size = serde_json::to_vec(&change)?.len();
            if !changes.is_empty() && total_bytes + size > self.config.max_batch_bytes {
                break;
            }
            total_bytes += size;
            changes.push(change);
            ids.push(entry.id);
            if changes.len() >= self.config.max_batch_count {
                break;
            }
        }
        Ok((changes, ids))
    }

    fn record_push_success(&self, resp: &PushResponse) -> CloudResult<()> {
        let now = now_millis();
        self.state.update(|s| {
            s.last_push_ts = if resp.server_ts > 0 { resp.server_ts } else { now };
            if !resp.next_cursor.is_empty() {
                s.cursor = resp.next_cursor.clone();
            }
            clear_failure(s);
        })?;
        Ok(())
    }

    // ── Pull ──

    async fn pull(&self, cancel: Option<&watch::Receiver<bool>>) {
        let _guard = self.pull_mu.lock().await;
        let trace_id = new_trace_id();
        if let Err(e) = self.page_through(Stream::Pull, &trace_id, cancel).await {
            self.record_failure("pull", &trace_id, &e);
        }
    }

    async fn resync_from_snapshot(&self, reason: &str) {
        let _guard = self.pull_mu.lock().await;
        let trace_id = new_trace_id();
        info!(trace_id = %trace_id, "resyncing from snapshot: {reason}");
        if let Err(e) = self.page_through(Stream::Snapshot, &trace_id, None).await {
            self.record_failure("snapshot", &trace_id, &e);
        }
    }

    async fn page_through(
        &self,
        stream: Stream,
        trace_id: &str,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> CloudResult<()> {
        let relay = require(&self.deps.relay, "relay client")?;
        let crypto = require(&self.deps.crypto, "crypto provider")?;
        let device = require(&self.deps.device, "device provider")?;
        let applier = require(&self.deps.applier, "applier")?;

        let mut cursor = match stream {
            Stream::Pull => {
                if self.in_backoff()? {
                    debug!(trace_id, "pull skipped: backing off");
                    return Ok(());
                }
                self.state.load()?.cursor
            }
            Stream::Snapshot => {
                self.state.update(|s| s.cursor.clear())?;
                String::new()
            }
        };
        let mut pages = 0usize;
        loop {
            if is_cancelled(cancel) {
                debug!(trace_id, "{} cancelled after {pages} pages", stream.name());
                return Ok(());
            }

            let req = PullRequest {
                device_id: device.device_id()?,
                cursor: cursor.clone(),
                limit: self.config.pull_limit,
            };
            let page = match stream {
                Stream::Pull => relay.pull(&req, trace_id).await?,
                Stream::Snapshot => relay.snapshot(&req, trace_id).await?,
            };

            let decoded = self.decode_page(crypto.as_ref(), &page.records)?;
            for record in &decoded {
                apply_record(applier.as_ref(), record).await?;
            }

            let advanced = !page.next_cursor.is_empty() && page.next_cursor != cursor;
            let now = now_millis();
            self.state.update(|s| {
                if !page.next_cursor.is_empty() {
                    s.cursor = page.next_cursor.clone();
                }
                s.last_pull_ts = now;
                clear_failure(s);
            })?;
            pages += 1;
            debug!(
                trace_id,
                "{} page {pages}: {} records, {} applied",
                stream.name(),
                page.records.len(),
                decoded.len()
            );

            if !page.has_more {
                return Ok(());
            }
            if !advanced {
                warn!(trace_id, "relay reported more pages without advancing the cursor");
                return Ok(());
            }
            cursor = page.next_cursor;
        }
    }

    /// Decrypts a whole page. Any failure rejects the page before anything
    /// is applied.
    fn decode_page(&self, crypto: &dyn SyncCrypto, records: &[Record]) -> CloudResult<Vec<Decoded>> {
        let disabled = self.disabled_plugins();
        let mut decoded = Vec::with_capacity(records.len());

        for record in records {
            match record.entity_type.as_str() {
                ENTITY_WOX_SETTING => {}
                ENTITY_PLUGIN_SETTING => {
                    if disabled.contains(&record.plugin_id) {
                        continue;
                    }
                }
                other => {
                    warn!("skipping record with unknown entity type {other:?}");
                    continue;
                }
            }

            let value = match record.op {
                Operation::Upsert => {
                    let sealed = record.value.as_ref().ok_or_else(|| {
                        CloudError::Apply(format!(
                            "upsert for {}:{} has no value",
                            record.entity_type, record.key
                        ))
                    })?;
                    let aad =
                        build_aad(&record.entity_type, &record.plugin_id, &record.key, record.op);
                    let plaintext = crypto.decrypt(sealed, &aad)?;
                    String::from_utf8(plaintext).map_err(|_| {
                        CloudError::Apply(format!("value for {} is not valid UTF-8", record.key))
                    })?
                }
                Operation::Delete => String::new(),
            };

            decoded.push(Decoded {
                entity_type: record.entity_type.clone(),
                plugin_id: record.plugin_id.clone(),
                key: record.key.clone(),
                op: record.op,
                value,
            });
        }
        Ok(decoded)
    }

    // ── Failure bookkeeping ──

    /// Every failure, wiring errors included, widens the shared backoff
    /// window. Nothing is rescheduled; the next tick or signal retries.
    fn record_failure(&self, what: &str, trace_id: &str, err: &CloudError) {
        let message = err.to_string();
        if err.is_configuration() {
            error!(trace_id, "{what} not possible: {message}");
        }

        let now = now_millis();
        let result = self.state.update(|s| {
            s.retry_count = s.retry_count.saturating_add(1);
            s.backoff_until = now + self.backoff.delay_ms(s.retry_count);
            s.last_error = message.clone();
        });
        match result {
            Ok(s) => warn!(
                trace_id,
                "{what} failed (retry {} in {}ms): {message}",
                s.retry_count,
                s.backoff_until - now
            ),
            Err(e) => error!(trace_id, "{what} failed: {message}; recording it also failed: {e}"),
        }
    }
}

/// Only background workers pass a cancel signal; manual calls run to the end.
fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.is_some_and(|rx| *rx.borrow())
}

fn clear_failure(s: &mut SyncState) {
    s.retry_count = 0;
    s.backoff_until = 0;
    s.last_error.clear();
}

fn encrypt_entry(crypto: &dyn SyncCrypto, entry: &OplogEntry) -> CloudResult<Change> {
    let plugin_id = plugin_id_for(&entry.entity_type, &entry.entity_id);
    let value = match entry.operation {
        Operation::Upsert => {
            let aad = build_aad(&entry.entity_type, &plugin_id, &entry.key, entry.operation);
            Some(crypto.encrypt(entry.value.as_bytes(), &aad)?)
        }
        Operation::Delete => None,
    };

    Ok(Change {
        change_id: Uuid::new_v4().to_string(),
        entity_type: entry.entity_type.clone(),
        plugin_id,
        key: entry.key.clone(),
        op: entry.operation,
        client_ts: entry.timestamp,
        value,
    })
}

async fn apply_record(applier: &dyn Applier, record: &Decoded) -> CloudResult<()> {
    if record.entity_type == ENTITY_PLUGIN_SETTING {
        applier
            .apply_plugin_setting(&record.plugin_id, &record.key, record.op, &record.value)
            .await
    } else {
        applier
            .apply_wox_setting(&record.key, record.op, &record.value)
            .await
    }
}

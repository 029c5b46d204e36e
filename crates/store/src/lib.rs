//! Orka store: watch-fed object cache with coalesced ingest and atomically swapped snapshots.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use orka_core::{Delta, DeltaKind, LabelSelector, ObjectKey, ResourceCache, Uid};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Coalescing queue keyed by UID with FIFO order and fixed capacity.
pub struct Coalescer {
    map: FxHashMap<Uid, Delta>,
    order: VecDeque<Uid>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap, dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta) {
        let uid = d.uid;
        if !self.map.contains_key(&uid) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(uid);
        }
        self.map.insert(uid, d);
    }

    /// Drain all currently coalesced deltas in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&uid) {
                out.push(d);
            }
        }
        out
    }
}

/// Immutable view of one cached type.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ObjectKey, Arc<Json>>,
}

/// Builds [`CacheSnapshot`]s from deltas.
#[derive(Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<Json>>,
    keys: FxHashMap<Uid, ObjectKey>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    /// Apply a batch of deltas; each batch bumps the epoch.
    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            match d.kind {
                DeltaKind::Applied => {
                    let key = match ObjectKey::of(&d.raw) {
                        Ok(k) => k,
                        Err(e) => {
                            debug!(error = %e, "skipping cache delta without key");
                            continue;
                        }
                    };
                    // a rename under the same uid drops the old key
                    if let Some(prev) = self.keys.insert(d.uid, key.clone()) {
                        if prev != key {
                            self.items.remove(&prev);
                        }
                    }
                    self.items.insert(key, Arc::new(d.raw));
                }
                DeltaKind::Deleted => {
                    let key = self.keys.remove(&d.uid).or_else(|| ObjectKey::of(&d.raw).ok());
                    if let Some(key) = key {
                        self.items.remove(&key);
                    }
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Read handle over the current snapshot; implements [`ResourceCache`].
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CacheHandle {
    /// A cache frozen at the given records (epoch 1), never updated.
    pub fn preloaded(objs: impl IntoIterator<Item = Json>) -> Self {
        let mut builder = SnapshotBuilder::new();
        let batch = objs
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let mut uid = [0u8; 16];
                uid[..8].copy_from_slice(&(i as u64).to_le_bytes());
                Delta { uid, kind: DeltaKind::Applied, raw }
            })
            .collect();
        builder.apply(batch);
        let (_tx, epoch_rx) = watch::channel(builder.epoch);
        Self { snap: Arc::new(ArcSwap::new(builder.freeze())), epoch_rx }
    }

    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until the first batch has been ingested or the timeout elapses; returns whether it synced.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.epoch_rx.clone();
        let wait = async {
            while *rx.borrow() == 0 {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        let synced = *self.epoch_rx.borrow() > 0;
        synced
    }
}

impl ResourceCache for CacheHandle {
    fn get(&self, key: &ObjectKey) -> Option<Json> {
        self.snap.load().items.get(key).map(|v| (**v).clone())
    }

    fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Json> {
        let snap = self.snap.load();
        let mut hits: Vec<(&ObjectKey, &Arc<Json>)> = snap
            .items
            .iter()
            .filter(|(k, _)| namespace.map(|ns| k.namespace() == Some(ns)).unwrap_or(true))
            .filter(|(_, v)| selector.matches_object(v))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(b.0));
        hits.into_iter().map(|(_, v)| (**v).clone()).collect()
    }
}

/// Spawn an ingest loop consuming deltas and swapping snapshots. Returns a sender for deltas and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Delta>, CacheHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = SnapshotBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let publish = |coalescer: &mut Coalescer, builder: &mut SnapshotBuilder| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return;
            }
            counter!("cache_deltas_total", batch.len() as u64);
            builder.apply(batch);
            let next = builder.freeze();
            let epoch = next.epoch;
            gauge!("cache_objects", next.items.len() as f64);
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            publish(&mut coalescer, &mut builder);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => publish(&mut coalescer, &mut builder),
            }
        }
        info!(dropped = coalescer.dropped(), "cache ingest loop stopped");
    });

    (tx, CacheHandle { snap, epoch_rx })
}

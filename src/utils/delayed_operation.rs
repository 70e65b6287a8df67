// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{interval, Duration};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

use crate::Shutdown;

/// One unit of deferred work, keyed by the partitions it waits on.
///
/// `try_complete` is a predicate over currently visible state; it must not
/// mutate anything and must answer `false` on any internal failure so the
/// operation stays watched until its deadline. `on_complete` runs exactly
/// once, on whichever of satisfaction or expiry fires first.
pub trait DelayedOperation: Send + Sync {
    fn delay_ms(&self) -> u64;

    fn try_complete(&self) -> impl Future<Output = bool> + Send;

    fn on_complete(&self) -> impl Future<Output = ()> + Send;

    /// Expiry bookkeeping, run after `on_complete` when the deadline won.
    fn on_expiration(&self) -> impl Future<Output = ()> + Send;
}

/// Completion-state wrapper. The flag makes completion idempotent and
/// mutually exclusive with timeout.
#[derive(Debug)]
struct DelayedOperationState<T: DelayedOperation> {
    operation: Arc<T>,
    completed: AtomicCell<bool>,
    delay_key: AtomicCell<Option<delay_queue::Key>>,
}

impl<T: DelayedOperation> DelayedOperationState<T> {
    fn new(operation: T) -> Self {
        Self {
            operation: Arc::new(operation),
            completed: AtomicCell::new(false),
            delay_key: AtomicCell::new(None),
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load()
    }

    async fn force_complete(&self) -> bool {
        if !self.completed.swap(true) {
            self.operation.on_complete().await;
            true
        } else {
            false
        }
    }
}

enum DelayQueueOp<T: DelayedOperation> {
    Insert(Arc<DelayedOperationState<T>>, Duration),
    Remove(delay_queue::Key),
}

/// Timer-indexed holding pen for operations that cannot complete yet:
/// produce waiting for replication, fetch waiting for bytes, delete-records
/// waiting for low-watermark movement, elect-leader waiting for the
/// coordinator. Watched per key; re-checked by `check_and_complete`; timed
/// out by a dedicated delay-queue task.
#[derive(Debug)]
pub struct DelayedOperationPurgatory<T: DelayedOperation + 'static> {
    name: String,
    watchers: DashMap<String, Vec<Arc<DelayedOperationState<T>>>>,
    delay_queue_tx: Sender<DelayQueueOp<T>>,
    /// Completed-but-still-watched tombstones; purge runs once this passes
    /// `purge_interval`.
    tombstones: AtomicCell<usize>,
    purge_interval: usize,
}

impl<T: DelayedOperation> DelayedOperationPurgatory<T> {
    pub async fn new(
        name: &str,
        purge_interval: usize,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (tx, rx): (Sender<DelayQueueOp<T>>, Receiver<DelayQueueOp<T>>) = mpsc::channel(1024);

        let purgatory = Arc::new(DelayedOperationPurgatory {
            name: name.to_string(),
            watchers: DashMap::new(),
            delay_queue_tx: tx,
            tombstones: AtomicCell::new(0),
            purge_interval,
        });
        purgatory
            .clone()
            .start(rx, Shutdown::new(notify_shutdown.subscribe()))
            .await;
        purgatory
    }

    /// Try the operation once; if unsatisfied, watch it under every key and
    /// arm its expiry timer. Returns true when it completed synchronously.
    pub async fn try_complete_else_watch(&self, operation: T, watch_keys: Vec<String>) -> bool {
        let op_state = Arc::new(DelayedOperationState::new(operation));

        if op_state.operation.try_complete().await && op_state.force_complete().await {
            return true;
        }

        for key in watch_keys {
            if op_state.is_completed() {
                break;
            }
            self.watchers
                .entry(key)
                .or_default()
                .push(Arc::clone(&op_state));
        }

        // Second attempt closes the race with state changes that happened
        // between the first attempt and registration.
        if op_state.operation.try_complete().await && op_state.force_complete().await {
            return true;
        }

        if !op_state.is_completed() {
            let delay = Duration::from_millis(op_state.operation.delay_ms());
            let _ = self
                .delay_queue_tx
                .send(DelayQueueOp::Insert(Arc::clone(&op_state), delay))
                .await;
        }

        false
    }

    /// Re-evaluate everything watched under `key`. Returns how many
    /// operations completed.
    pub async fn check_and_complete(&self, key: &str) -> usize {
        let watcher_list = match self.watchers.get(key) {
            Some(list) => list.value().clone(),
            None => return 0,
        };
        let mut completed = 0;
        for op in watcher_list {
            if !op.is_completed() && op.operation.try_complete().await && op.force_complete().await
            {
                completed += 1;
                self.tombstones.fetch_add(1);
                if let Some(delay_key) = op.delay_key.load() {
                    let _ = self
                        .delay_queue_tx
                        .send(DelayQueueOp::Remove(delay_key))
                        .await;
                }
            }
        }
        completed
    }

    pub fn watched_count(&self) -> usize {
        self.watchers.iter().map(|e| e.value().len()).sum()
    }

    async fn start(self: Arc<Self>, mut delay_queue_rx: Receiver<DelayQueueOp<T>>, mut shutdown: Shutdown) {
        let name = self.name.clone();
        let purgatory = Arc::clone(&self);
        tokio::spawn(async move {
            let mut delay_queue = DelayQueue::new();
            let mut purge_tick = interval(Duration::from_millis(500));

            loop {
                tokio::select! {
                    Some(op) = delay_queue_rx.recv() => {
                        match op {
                            DelayQueueOp::Insert(state, duration) => {
                                if state.is_completed() {
                                    continue;
                                }
                                let key = delay_queue.insert(state.clone(), duration);
                                state.delay_key.store(Some(key));
                            }
                            DelayQueueOp::Remove(key) => {
                                delay_queue.try_remove(&key);
                            }
                        }
                    }
                    Some(expired) = delay_queue.next() => {
                        let op = expired.into_inner();
                        op.delay_key.store(None);
                        if op.force_complete().await {
                            purgatory.tombstones.fetch_add(1);
                            op.operation.on_expiration().await;
                        }
                    }
                    _ = purge_tick.tick() => {
                        if purgatory.tombstones.load() > purgatory.purge_interval {
                            purgatory.tombstones.store(0);
                            purgatory.purge_completed();
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("purgatory {} shutting down", name);
                        break;
                    }
                }
            }
        });
    }

    fn purge_completed(&self) {
        let mut keys_to_remove = Vec::new();
        for mut entry in self.watchers.iter_mut() {
            entry.value_mut().retain(|op| !op.is_completed());
            if entry.value().is_empty() {
                keys_to_remove.push(entry.key().clone());
            }
        }
        for key in keys_to_remove {
            self.watchers.remove_if(&key, |_, ops| ops.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;
    use tokio::sync::Mutex;

    use super::*;

    struct TestOp {
        ready: AtomicCell<bool>,
        delay_ms: u64,
        completions: Arc<AtomicCell<usize>>,
        expired: Arc<AtomicCell<bool>>,
        tx: Mutex<Option<oneshot::Sender<()>>>,
    }

    impl TestOp {
        fn new(ready: bool, delay_ms: u64) -> (Self, oneshot::Receiver<()>) {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    ready: AtomicCell::new(ready),
                    delay_ms,
                    completions: Arc::new(AtomicCell::new(0)),
                    expired: Arc::new(AtomicCell::new(false)),
                    tx: Mutex::new(Some(tx)),
                },
                rx,
            )
        }
    }

    impl DelayedOperation for TestOp {
        fn delay_ms(&self) -> u64 {
            self.delay_ms
        }

        async fn try_complete(&self) -> bool {
            self.ready.load()
        }

        async fn on_complete(&self) {
            self.completions.fetch_add(1);
            if let Some(tx) = self.tx.lock().await.take() {
                let _ = tx.send(());
            }
        }

        async fn on_expiration(&self) {
            self.expired.store(true);
        }
    }

    #[tokio::test]
    async fn test_immediate_completion() {
        let (notify, _) = broadcast::channel(1);
        let purgatory = DelayedOperationPurgatory::new("produce", 1000, notify).await;
        let (op, _rx) = TestOp::new(true, 10_000);
        assert!(
            purgatory
                .try_complete_else_watch(op, vec!["t-0".into()])
                .await
        );
        assert_eq!(purgatory.watched_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_via_check() {
        let (notify, _) = broadcast::channel(1);
        let purgatory = DelayedOperationPurgatory::new("produce", 1000, notify).await;
        let (op, rx) = TestOp::new(false, 10_000);
        // not ready yet, so it parks
        assert!(
            !purgatory
                .try_complete_else_watch(op, vec!["t-0".into()])
                .await
        );
        assert_eq!(purgatory.check_and_complete("t-0").await, 0);
        // flip readiness through the watcher list
        for entry in purgatory.watchers.iter() {
            for op in entry.value() {
                op.operation.ready.store(true);
            }
        }
        assert_eq!(purgatory.check_and_complete("t-0").await, 1);
        rx.await.unwrap();
        // second check is a no-op: completion is idempotent
        assert_eq!(purgatory.check_and_complete("t-0").await, 0);
    }

    #[tokio::test]
    async fn test_timeout_fires_once() {
        let (notify, _) = broadcast::channel(1);
        let purgatory = DelayedOperationPurgatory::new("fetch", 1000, notify).await;
        let (op, rx) = TestOp::new(false, 20);
        let expired = op.expired.clone();
        let completions = op.completions.clone();
        assert!(
            !purgatory
                .try_complete_else_watch(op, vec!["t-0".into()])
                .await
        );
        rx.await.unwrap();
        assert!(expired.load());
        assert_eq!(completions.load(), 1);
        // late check cannot complete it a second time
        assert_eq!(purgatory.check_and_complete("t-0").await, 0);
        assert_eq!(completions.load(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_tombstones() {
        let (notify, _) = broadcast::channel(1);
        let purgatory = DelayedOperationPurgatory::new("delete", 0, notify).await;
        let (op, rx) = TestOp::new(false, 30);
        purgatory
            .try_complete_else_watch(op, vec!["t-0".into(), "t-1".into()])
            .await;
        assert_eq!(purgatory.watched_count(), 2);
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(purgatory.watched_count(), 0);
    }
}

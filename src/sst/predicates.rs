//! Trigger predicate engine: callers register `(predicate, trigger)` pairs
//! against the table; a single evaluator thread scans them and invokes
//! triggers whose predicates hold. Triggers run serially on that thread and
//! may register further predicates, call `put`, and mutate the local row.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use crate::sst::SharedStateTable;

/// Handle to a registered predicate, used for removal.
pub(crate) type PredHandle = u64;

/// Lifetime of a registered predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PredicateKind {
    /// Deregistered automatically after its trigger fires once.
    OneTime,

    /// Stays registered until removed explicitly.
    Recurrent,
}

type PredicateFn = Box<dyn Fn(&SharedStateTable) -> bool + Send + Sync>;
type TriggerFn = Box<dyn FnMut(&SharedStateTable) + Send>;

struct Entry {
    handle: PredHandle,
    kind: PredicateKind,
    pred: PredicateFn,
    trig: StdMutex<TriggerFn>,
    active: AtomicBool,
}

/// Registry of trigger predicates for one table.
pub(crate) struct PredicateEngine {
    entries: StdMutex<Vec<Arc<Entry>>>,
    next_handle: AtomicU64,
    shutdown: AtomicBool,
}

impl PredicateEngine {
    pub(crate) fn new() -> PredicateEngine {
        PredicateEngine {
            entries: StdMutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registers a predicate/trigger pair; returns its removal handle.
    pub(crate) fn insert(
        &self,
        pred: impl Fn(&SharedStateTable) -> bool + Send + Sync + 'static,
        trig: impl FnMut(&SharedStateTable) + Send + 'static,
        kind: PredicateKind,
    ) -> PredHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            handle,
            kind,
            pred: Box::new(pred),
            trig: StdMutex::new(Box::new(trig)),
            active: AtomicBool::new(true),
        });
        self.entries.lock().unwrap().push(entry);
        handle
    }

    /// Deregisters a predicate by handle. Safe to call from a trigger.
    pub(crate) fn remove(&self, handle: PredHandle) {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) =
            entries.iter().find(|e| e.handle == handle)
        {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Signals the evaluator thread to exit after its current round and
    /// drops all registered entries (their captures keep engines alive
    /// otherwise).
    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.entries.lock().unwrap().clear();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Evaluates all active predicates once against the table, firing the
    /// triggers of those that hold. Returns true if any trigger fired.
    pub(crate) fn eval_round(&self, table: &SharedStateTable) -> bool {
        // snapshot the registered list so triggers may re-register
        let snapshot: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|e| e.active.load(Ordering::Acquire));
            entries.clone()
        };

        let mut fired = false;
        for entry in snapshot {
            if self.is_shut_down() {
                // a trigger this round retired the whole table
                break;
            }
            if !entry.active.load(Ordering::Acquire) {
                continue; // removed by an earlier trigger this round
            }
            if !(entry.pred)(table) {
                continue;
            }
            if entry.kind == PredicateKind::OneTime {
                // deactivate before firing so a trigger that blocks
                // cannot be re-entered next round
                entry.active.store(false, Ordering::Release);
            }
            let mut trig = entry.trig.lock().unwrap();
            (trig)(table);
            fired = true;
        }
        fired
    }

    /// Spawns the single evaluator thread for the given table. The thread
    /// exits once `shut_down` is called on the table's engine.
    pub(crate) fn spawn_evaluator(
        table: Arc<SharedStateTable>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("sst-preds-v{}", table.vid()))
            .spawn(move || {
                pf_debug!(table.my_id(); "predicate thread spawned");
                while !table.predicates.is_shut_down() {
                    if !table.predicates.eval_round(&table) {
                        // nothing fired this round, back off briefly
                        thread::sleep(Duration::from_micros(50));
                    }
                }
                pf_debug!(table.my_id(); "predicate thread exited");
            })
            .expect("spawning predicate thread should succeed")
    }
}

#[cfg(test)]
mod predicates_tests {
    use super::*;
    use crate::sst::RowShape;
    use crate::transport::Fabric;

    use std::sync::atomic::AtomicUsize;

    async fn dummy_table() -> Arc<SharedStateTable> {
        let fabric = Arc::new(
            Fabric::new_and_setup(0, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        Arc::new(SharedStateTable::new(
            0,
            vec![0],
            0,
            RowShape {
                num_members: 1,
                num_subgroups: 1,
                num_received_cols: 1,
                window_size: 2,
            },
            fabric,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_time_fires_once() {
        let table = dummy_table().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        table.predicates.insert(
            |_| true,
            move |_| {
                count_ref.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::OneTime,
        );
        assert!(table.predicates.eval_round(&table));
        assert!(!table.predicates.eval_round(&table));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recurrent_fires_until_removed() {
        let table = dummy_table().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        let handle = table.predicates.insert(
            |_| true,
            move |_| {
                count_ref.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::Recurrent,
        );
        assert!(table.predicates.eval_round(&table));
        assert!(table.predicates.eval_round(&table));
        table.predicates.remove(handle);
        assert!(!table.predicates.eval_round(&table));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn predicate_gates_trigger() {
        let table = dummy_table().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        table.predicates.insert(
            |t| t.row(0).seq_num[0] >= 0,
            move |_| {
                count_ref.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::Recurrent,
        );
        assert!(!table.predicates.eval_round(&table));
        table.update_local(|row| row.seq_num[0] = 3);
        assert!(table.predicates.eval_round(&table));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trigger_may_register_more() {
        let table = dummy_table().await;
        let count = Arc::new(AtomicUsize::new(0));
        let table_ref = table.clone();
        let count_ref = count.clone();
        table.predicates.insert(
            |_| true,
            move |_| {
                let inner_count = count_ref.clone();
                table_ref.predicates.insert(
                    |_| true,
                    move |_| {
                        inner_count.fetch_add(1, Ordering::SeqCst);
                    },
                    PredicateKind::OneTime,
                );
            },
            PredicateKind::OneTime,
        );
        assert!(table.predicates.eval_round(&table));
        assert!(table.predicates.eval_round(&table));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

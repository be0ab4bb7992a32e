//! Shared-state table: a row per member, replicated on every member, with
//! one-sided writes pushing the local row to peers. Only this member's row
//! is ever mutated locally; remote rows change solely by applying received
//! row updates. Trigger predicates fire on locally-visible changes.

mod predicates;
mod multicast;

pub(crate) use multicast::SstMulticast;
pub(crate) use predicates::{
    PredicateEngine, PredicateKind, PredHandle,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::transport::{Fabric, WireMsg, WorkId};
use crate::utils::SquallError;
use crate::{NodeId, SubgroupId};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Index of a member within the current view (row index in the table).
pub(crate) type MemberRank = usize;

/// A membership change proposed by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ChangeProposal {
    /// The node joining or departing.
    pub node_id: NodeId,

    /// Join or departure.
    pub kind: ChangeKind,

    /// For joins: the joiner's fabric listen address.
    #[get_size(ignore)]
    pub joiner_fabric_addr: Option<SocketAddr>,

    /// For joins: the joiner's membership-service listen address.
    #[get_size(ignore)]
    pub joiner_gms_addr: Option<SocketAddr>,
}

/// Kind of a membership change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub enum ChangeKind {
    Join,
    Depart,
}

/// One in-band payload slot inside a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub(crate) struct SlotEntry {
    /// Reuse generation: `index / window_size + 1` of the staged message.
    pub(crate) next_seq: u64,

    /// Size in bytes of the staged message (header included).
    pub(crate) size: u32,

    /// Message bytes.
    pub(crate) buf: Vec<u8>,
}

impl SlotEntry {
    fn empty() -> SlotEntry {
        SlotEntry {
            next_seq: 0,
            size: 0,
            buf: Vec::new(),
        }
    }
}

/// Column dimensions of a row, fixed per view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowShape {
    /// Number of members in the view (length of `suspected`).
    pub(crate) num_members: usize,

    /// Number of subgroups (length of the per-subgroup counter arrays).
    pub(crate) num_subgroups: usize,

    /// Total sender columns across subgroups (length of `num_received`).
    pub(crate) num_received_cols: usize,

    /// Per-sender window size (slots per subgroup).
    pub(crate) window_size: usize,
}

/// One member's row. All counters start at -1 ("nothing yet").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, GetSize)]
pub(crate) struct SstRow {
    /// View ID this row belongs to.
    pub(crate) vid: i32,

    /// Which members this member suspects to have failed.
    pub(crate) suspected: Vec<bool>,

    /// Proposed membership changes (leader appends; others copy).
    pub(crate) changes: Vec<ChangeProposal>,

    /// Number of changes proposed so far.
    pub(crate) num_changes: i32,

    /// Number of changes committed by the leader.
    pub(crate) num_committed: i32,

    /// Number of changes this member has acknowledged.
    pub(crate) num_acked: i32,

    /// Total number of changes installed across all views so far.
    pub(crate) num_installed: i32,

    /// Ragged-edge commit point per sender column; valid per subgroup only
    /// once the matching `global_min_ready` flag is raised.
    pub(crate) global_min: Vec<i64>,

    /// Per-subgroup flag: shard leader has published `global_min`.
    pub(crate) global_min_ready: Vec<bool>,

    /// Per-subgroup highest contiguous sequence number received.
    pub(crate) seq_num: Vec<i64>,

    /// Per-subgroup stability frontier published by this member.
    pub(crate) stable_num: Vec<i64>,

    /// Per-subgroup delivery frontier published by this member.
    pub(crate) delivered_num: Vec<i64>,

    /// Per-subgroup persistence frontier published by this member.
    pub(crate) persisted_num: Vec<i64>,

    /// Per sender column: highest contiguous message index received.
    pub(crate) num_received: Vec<i64>,

    /// Per sender column: highest index consumed off the slot path.
    pub(crate) num_received_sst: Vec<i64>,

    /// In-band payload slots, `window_size` per subgroup.
    pub(crate) slots: Vec<SlotEntry>,

    /// Liveness beat counter, bumped by the timeout thread.
    pub(crate) heartbeat: u64,
}

impl SstRow {
    pub(crate) fn new(vid: i32, shape: &RowShape) -> SstRow {
        SstRow {
            vid,
            suspected: vec![false; shape.num_members],
            changes: Vec::new(),
            num_changes: 0,
            num_committed: 0,
            num_acked: 0,
            num_installed: 0,
            global_min: vec![-1; shape.num_received_cols],
            global_min_ready: vec![false; shape.num_subgroups],
            seq_num: vec![-1; shape.num_subgroups],
            stable_num: vec![-1; shape.num_subgroups],
            delivered_num: vec![-1; shape.num_subgroups],
            persisted_num: vec![-1; shape.num_subgroups],
            num_received: vec![-1; shape.num_received_cols],
            num_received_sst: vec![-1; shape.num_received_cols],
            slots: (0..shape.num_subgroups * shape.window_size)
                .map(|_| SlotEntry::empty())
                .collect(),
            heartbeat: 0,
        }
    }

    /// Extracts the named field range for shipping to peers.
    fn extract(&self, range: RowRange) -> RangePayload {
        match range {
            RowRange::All => RangePayload::WholeRow(Box::new(self.clone())),
            RowRange::Gms => RangePayload::Gms {
                suspected: self.suspected.clone(),
                changes: self.changes.clone(),
                num_changes: self.num_changes,
                num_committed: self.num_committed,
                num_acked: self.num_acked,
                num_installed: self.num_installed,
            },
            RowRange::GlobalMin => RangePayload::GlobalMin {
                global_min: self.global_min.clone(),
                ready: self.global_min_ready.clone(),
            },
            RowRange::SeqNum(s) => RangePayload::SeqNum {
                subgroup: s,
                val: self.seq_num[s as usize],
            },
            RowRange::StableNum(s) => RangePayload::StableNum {
                subgroup: s,
                val: self.stable_num[s as usize],
            },
            RowRange::DeliveredNum(s) => RangePayload::DeliveredNum {
                subgroup: s,
                val: self.delivered_num[s as usize],
            },
            RowRange::PersistedNum(s) => RangePayload::PersistedNum {
                subgroup: s,
                val: self.persisted_num[s as usize],
            },
            RowRange::NumReceived { offset, count } => {
                RangePayload::NumReceived {
                    offset,
                    vals: self.num_received
                        [offset as usize..(offset + count) as usize]
                        .to_vec(),
                }
            }
            RowRange::NumReceivedSst { offset, count } => {
                RangePayload::NumReceivedSst {
                    offset,
                    vals: self.num_received_sst
                        [offset as usize..(offset + count) as usize]
                        .to_vec(),
                }
            }
            RowRange::Slot(index) => RangePayload::Slot {
                index,
                slot: self.slots[index as usize].clone(),
            },
            RowRange::Heartbeat => RangePayload::Heartbeat {
                beat: self.heartbeat,
            },
        }
    }

    /// Applies a received field range; whole fields are replaced so writes
    /// stay atomic at field granularity.
    fn apply(&mut self, payload: RangePayload) {
        match payload {
            RangePayload::WholeRow(row) => *self = *row,
            RangePayload::Gms {
                suspected,
                changes,
                num_changes,
                num_committed,
                num_acked,
                num_installed,
            } => {
                self.suspected = suspected;
                self.changes = changes;
                self.num_changes = num_changes;
                self.num_committed = num_committed;
                self.num_acked = num_acked;
                self.num_installed = num_installed;
            }
            RangePayload::GlobalMin { global_min, ready } => {
                self.global_min = global_min;
                self.global_min_ready = ready;
            }
            RangePayload::SeqNum { subgroup, val } => {
                self.seq_num[subgroup as usize] = val;
            }
            RangePayload::StableNum { subgroup, val } => {
                self.stable_num[subgroup as usize] = val;
            }
            RangePayload::DeliveredNum { subgroup, val } => {
                self.delivered_num[subgroup as usize] = val;
            }
            RangePayload::PersistedNum { subgroup, val } => {
                self.persisted_num[subgroup as usize] = val;
            }
            RangePayload::NumReceived { offset, vals } => {
                let offset = offset as usize;
                self.num_received[offset..offset + vals.len()]
                    .copy_from_slice(&vals);
            }
            RangePayload::NumReceivedSst { offset, vals } => {
                let offset = offset as usize;
                self.num_received_sst[offset..offset + vals.len()]
                    .copy_from_slice(&vals);
            }
            RangePayload::Slot { index, slot } => {
                self.slots[index as usize] = slot;
            }
            RangePayload::Heartbeat { beat } => {
                self.heartbeat = beat;
            }
        }
    }
}

/// Names a field range of the local row for a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowRange {
    All,
    Gms,
    GlobalMin,
    SeqNum(SubgroupId),
    StableNum(SubgroupId),
    DeliveredNum(SubgroupId),
    PersistedNum(SubgroupId),
    NumReceived { offset: u32, count: u32 },
    NumReceivedSst { offset: u32, count: u32 },
    Slot(u32),
    Heartbeat,
}

/// Contents of a field range in flight to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, GetSize)]
pub(crate) enum RangePayload {
    WholeRow(Box<SstRow>),
    Gms {
        suspected: Vec<bool>,
        changes: Vec<ChangeProposal>,
        num_changes: i32,
        num_committed: i32,
        num_acked: i32,
        num_installed: i32,
    },
    GlobalMin {
        global_min: Vec<i64>,
        ready: Vec<bool>,
    },
    SeqNum {
        subgroup: SubgroupId,
        val: i64,
    },
    StableNum {
        subgroup: SubgroupId,
        val: i64,
    },
    DeliveredNum {
        subgroup: SubgroupId,
        val: i64,
    },
    PersistedNum {
        subgroup: SubgroupId,
        val: i64,
    },
    NumReceived {
        offset: u32,
        vals: Vec<i64>,
    },
    NumReceivedSst {
        offset: u32,
        vals: Vec<i64>,
    },
    Slot {
        index: u32,
        slot: SlotEntry,
    },
    Heartbeat {
        beat: u64,
    },
}

/// A row-range write in flight between two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, GetSize)]
pub(crate) struct RowUpdate {
    /// Writer's node ID.
    pub(crate) from: NodeId,

    /// View the write belongs to; stale-view writes are dropped.
    pub(crate) vid: i32,

    /// The field range content.
    pub(crate) payload: RangePayload,
}

/// The shared-state table of one view on one member.
pub(crate) struct SharedStateTable {
    /// My row index.
    my_rank: MemberRank,

    /// My node ID.
    my_id: NodeId,

    /// View ID this table belongs to.
    vid: i32,

    /// Row index -> node ID, in view order.
    members: Vec<NodeId>,

    /// The rows. Index i is member i's row; row `my_rank` is written
    /// locally, all others only via `apply_update`.
    rows: Vec<RwLock<SstRow>>,

    /// Row column dimensions.
    shape: RowShape,

    /// Trigger predicates registered against this table.
    pub(crate) predicates: PredicateEngine,

    /// The connection fabric used for row pushes.
    fabric: Arc<Fabric<WireMsg>>,

    /// Barrier round counter for `sync_with_members`.
    barrier_seq: AtomicU64,
}

impl SharedStateTable {
    pub(crate) fn new(
        vid: i32,
        members: Vec<NodeId>,
        my_rank: MemberRank,
        shape: RowShape,
        fabric: Arc<Fabric<WireMsg>>,
    ) -> SharedStateTable {
        debug_assert_eq!(members.len(), shape.num_members);
        let my_id = members[my_rank];
        let rows = (0..members.len())
            .map(|_| RwLock::new(SstRow::new(vid, &shape)))
            .collect();
        SharedStateTable {
            my_rank,
            my_id,
            vid,
            members,
            rows,
            shape,
            predicates: PredicateEngine::new(),
            fabric,
            barrier_seq: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn my_rank(&self) -> MemberRank {
        self.my_rank
    }

    #[inline]
    pub(crate) fn my_id(&self) -> NodeId {
        self.my_id
    }

    #[inline]
    pub(crate) fn vid(&self) -> i32 {
        self.vid
    }

    #[inline]
    pub(crate) fn num_rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub(crate) fn members(&self) -> &[NodeId] {
        &self.members
    }

    #[inline]
    pub(crate) fn shape(&self) -> &RowShape {
        &self.shape
    }

    /// Rank of a node in this table, if a member.
    pub(crate) fn rank_of(&self, id: NodeId) -> Option<MemberRank> {
        self.members.iter().position(|&m| m == id)
    }

    /// Read access to any member's row.
    pub(crate) fn row(&self, rank: MemberRank) -> RwLockReadGuard<SstRow> {
        self.rows[rank].read().unwrap()
    }

    /// Mutates the local row. Never use for any other row.
    pub(crate) fn update_local<R>(
        &self,
        f: impl FnOnce(&mut SstRow) -> R,
    ) -> R {
        let mut row = self.rows[self.my_rank].write().unwrap();
        f(&mut row)
    }

    /// Applies a row update received from a peer into its row copy.
    pub(crate) fn apply_update(&self, update: RowUpdate) {
        if update.vid != self.vid {
            pf_trace!(self.my_id;
                      "dropping row update for stale vid {}", update.vid);
            return;
        }
        let rank = match self.rank_of(update.from) {
            Some(rank) => rank,
            None => {
                pf_warn!(self.my_id;
                         "row update from non-member {}", update.from);
                return;
            }
        };
        if rank == self.my_rank {
            return; // nobody else may write my row
        }
        let mut row = self.rows[rank].write().unwrap();
        row.apply(update.payload);
    }

    /// Pushes the named range of my row to the given member ranks (all
    /// rows but mine when `None`). Returns once the writes are posted.
    pub(crate) fn put(
        &self,
        targets: Option<&[MemberRank]>,
        range: RowRange,
    ) -> Result<(), SquallError> {
        let update = self.make_update(range);
        for peer in self.target_ids(targets) {
            // errors on individual failed peers surface via suspicion, not
            // through the put path
            if let Err(e) =
                self.fabric.post(peer, WireMsg::Row(update.clone()))
            {
                pf_trace!(self.my_id; "put to {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Like `put` but tags the writes with a work ID whose completion can
    /// be awaited with `wait_completion`.
    pub(crate) fn put_with_completion(
        &self,
        targets: Option<&[MemberRank]>,
        range: RowRange,
    ) -> Result<WorkId, SquallError> {
        let update = self.make_update(range);
        let peers = self.target_ids(targets);
        self.fabric
            .post_with_completion(&peers, WireMsg::Row(update))
    }

    /// Blocks until the writes under `work` completed on all targets.
    /// Returns the peers that failed or stayed silent past the timeout.
    pub(crate) fn wait_completion(
        &self,
        work: WorkId,
        timeout: Duration,
    ) -> Result<(), Vec<NodeId>> {
        self.fabric.wait_completion(work, timeout)
    }

    /// Barrier with the given member ranks via blob exchange.
    pub(crate) fn sync_with_members(
        &self,
        targets: Option<&[MemberRank]>,
        timeout: Duration,
    ) -> Result<(), SquallError> {
        let seq = self.barrier_seq.fetch_add(1, Ordering::SeqCst);
        let tag = ((self.vid as u64) << 32) | seq;
        let peers = self.target_ids(targets);
        self.fabric.barrier(tag, &peers, timeout)
    }

    fn make_update(&self, range: RowRange) -> RowUpdate {
        let row = self.rows[self.my_rank].read().unwrap();
        RowUpdate {
            from: self.my_id,
            vid: self.vid,
            payload: row.extract(range),
        }
    }

    fn target_ids(
        &self,
        targets: Option<&[MemberRank]>,
    ) -> Vec<NodeId> {
        let ids: Vec<NodeId> = match targets {
            Some(ranks) => ranks
                .iter()
                .filter(|&&r| r != self.my_rank)
                .map(|&r| self.members[r])
                .collect(),
            None => self
                .members
                .iter()
                .enumerate()
                .filter(|&(r, _)| r != self.my_rank)
                .map(|(_, &id)| id)
                .collect(),
        };
        // peers whose connection already errored are out of the game
        ids.into_iter()
            .filter(|&id| !self.fabric.is_failed(id))
            .collect()
    }
}

#[cfg(test)]
mod sst_tests {
    use super::*;

    fn test_shape() -> RowShape {
        RowShape {
            num_members: 3,
            num_subgroups: 2,
            num_received_cols: 3,
            window_size: 4,
        }
    }

    #[test]
    fn fresh_row_counters_negative() {
        let row = SstRow::new(0, &test_shape());
        assert!(row.seq_num.iter().all(|&v| v == -1));
        assert!(row.stable_num.iter().all(|&v| v == -1));
        assert!(row.delivered_num.iter().all(|&v| v == -1));
        assert!(row.persisted_num.iter().all(|&v| v == -1));
        assert!(row.num_received.iter().all(|&v| v == -1));
        assert_eq!(row.slots.len(), 8);
    }

    #[test]
    fn extract_apply_round_trip() {
        let shape = test_shape();
        let mut src = SstRow::new(3, &shape);
        src.seq_num[1] = 42;
        src.num_received[2] = 17;
        src.suspected[0] = true;
        src.num_changes = 2;

        let mut dst = SstRow::new(3, &shape);
        dst.apply(src.extract(RowRange::SeqNum(1)));
        assert_eq!(dst.seq_num[1], 42);

        dst.apply(src.extract(RowRange::NumReceived {
            offset: 0,
            count: 3,
        }));
        assert_eq!(dst.num_received, vec![-1, -1, 17]);

        dst.apply(src.extract(RowRange::Gms));
        assert!(dst.suspected[0]);
        assert_eq!(dst.num_changes, 2);

        dst.apply(src.extract(RowRange::All));
        assert_eq!(dst, src);
    }

    #[test]
    fn apply_slot_replaces_whole_field() {
        let shape = test_shape();
        let mut src = SstRow::new(0, &shape);
        src.slots[5] = SlotEntry {
            next_seq: 2,
            size: 3,
            buf: vec![1, 2, 3],
        };
        let mut dst = SstRow::new(0, &shape);
        dst.apply(src.extract(RowRange::Slot(5)));
        assert_eq!(dst.slots[5], src.slots[5]);
        assert_eq!(dst.slots[4], SlotEntry::empty());
    }
}

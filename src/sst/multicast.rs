//! Small-payload multicast carried in-band inside the sender's own row
//! slots. The sender stages `(next_seq, size, bytes)` into the slot for
//! `index % window_size` and pushes just that slot range; receivers detect
//! the `next_seq` bump through the receiver predicate and consume the slot
//! bytes in place from their row copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sst::{MemberRank, RowRange, SharedStateTable, SlotEntry};
use crate::utils::SquallError;
use crate::SubgroupId;

/// Sender-side handle for one subgroup's slot window.
pub(crate) struct SstMulticast {
    sst: Arc<SharedStateTable>,

    subgroup: SubgroupId,

    /// Slots per sender for this subgroup.
    window_size: u64,

    /// First slot index of this subgroup's window in the row.
    slot_base: u32,

    /// Capacity of one slot's payload bytes.
    slot_capacity: usize,

    /// Row indices of the shard members (put targets).
    shard_ranks: Vec<MemberRank>,

    /// Count of messages staged so far. Slots are used round-robin by
    /// this count, NOT by message index: paused turns advance indices
    /// but occupy no slot, and receivers count consumed slots the same
    /// way through `num_received_sst`.
    staged: AtomicU64,
}

impl SstMulticast {
    pub(crate) fn new(
        sst: Arc<SharedStateTable>,
        subgroup: SubgroupId,
        window_size: u64,
        slot_capacity: usize,
        shard_ranks: Vec<MemberRank>,
    ) -> SstMulticast {
        let slot_base = subgroup * window_size as u32;
        SstMulticast {
            sst,
            subgroup,
            window_size,
            slot_base,
            slot_capacity,
            shard_ranks,
            staged: AtomicU64::new(0),
        }
    }

    /// Stages the message into the next slot of the window and pushes
    /// the slot to all shard members. The caller guarantees the slot is
    /// free for reuse (flow-control window already validated).
    pub(crate) fn send(&self, bytes: &[u8]) -> Result<(), SquallError> {
        if bytes.len() > self.slot_capacity {
            return Err(SquallError(format!(
                "message of {} B exceeds slot capacity {}",
                bytes.len(),
                self.slot_capacity
            )));
        }

        let count = self.staged.fetch_add(1, Ordering::SeqCst);
        let slot_index =
            self.slot_base + (count % self.window_size) as u32;
        let next_seq = count / self.window_size + 1;

        self.sst.update_local(|row| {
            row.slots[slot_index as usize] = SlotEntry {
                next_seq,
                size: bytes.len() as u32,
                buf: bytes.to_vec(),
            };
        });
        self.sst.put(
            Some(&self.shard_ranks),
            RowRange::Slot(slot_index),
        )?;
        pf_trace!(self.sst.my_id();
                  "slot send subgroup {} slot {} ({} B)",
                  self.subgroup, slot_index, bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod smc_tests {
    use super::*;
    use crate::sst::RowShape;
    use crate::transport::Fabric;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_staging_wraps_window() -> Result<(), SquallError> {
        let fabric = Arc::new(
            Fabric::new_and_setup(0, "127.0.0.1:0".parse()?).await?,
        );
        let sst = Arc::new(SharedStateTable::new(
            0,
            vec![0],
            0,
            RowShape {
                num_members: 1,
                num_subgroups: 2,
                num_received_cols: 2,
                window_size: 3,
            },
            fabric,
        ));
        let smc =
            SstMulticast::new(sst.clone(), 1, 3, 64, vec![0]);

        smc.send(&[1, 1])?;
        smc.send(&[2, 2])?;
        smc.send(&[3, 3])?;
        smc.send(&[4, 4])?; // wraps onto slot 0 of subgroup 1

        let row = sst.row(0);
        // subgroup 1's window starts at slot 3
        assert_eq!(row.slots[3].next_seq, 2); // second generation
        assert_eq!(row.slots[3].buf, vec![4, 4]);
        assert_eq!(row.slots[4].next_seq, 1);
        assert_eq!(row.slots[4].buf, vec![2, 2]);
        assert_eq!(row.slots[5].next_seq, 1);
        assert_eq!(row.slots[5].buf, vec![3, 3]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_message_rejected() -> Result<(), SquallError> {
        let fabric = Arc::new(
            Fabric::new_and_setup(0, "127.0.0.1:0".parse()?).await?,
        );
        let sst = Arc::new(SharedStateTable::new(
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
        ));
        let smc = SstMulticast::new(sst, 0, 2, 8, vec![0]);
        assert!(smc.send(&[0u8; 9]).is_err());
        Ok(())
    }
}

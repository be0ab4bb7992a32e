//! Reliable pipelined block multicast for large payloads. A group exists
//! per `(subgroup, sender)` pair over a rotated member ordering that puts
//! the sender at position 0. Payloads are sliced into `block_size` units
//! and relayed along a binomial-tree or chain schedule; receivers ask the
//! owner for a destination buffer before the first block lands and get a
//! completion upcall once the full message is in place.

mod schedule;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use crate::transport::{Fabric, MessageBuffer, WireMsg};
use crate::utils::{Bitmap, SquallError};
use crate::NodeId;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Group number type; unique per `(subgroup, sender)` across one view,
/// offset per view so stale blocks cannot alias new groups.
pub(crate) type RdmcGroupNum = u16;

/// Relay schedule selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum Algorithm {
    BinomialSend,
    ChainSend,
}

impl Algorithm {
    /// Parses the configuration string form.
    pub fn from_config(name: &str) -> Result<Algorithm, SquallError> {
        match name {
            "binomial_send" => Ok(Algorithm::BinomialSend),
            "chain_send" => Ok(Algorithm::ChainSend),
            _ => Err(SquallError(format!(
                "unrecognized algorithm '{}'",
                name
            ))),
        }
    }

    fn children(&self, pos: usize, n: usize) -> Vec<usize> {
        match self {
            Algorithm::BinomialSend => {
                schedule::binomial_children(pos, n)
            }
            Algorithm::ChainSend => schedule::chain_children(pos, n),
        }
    }
}

/// One block of a message in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, GetSize)]
pub(crate) struct BlockFrame {
    /// Group the block belongs to.
    pub(crate) group: RdmcGroupNum,

    /// Sender's per-group message counter.
    pub(crate) msg_id: u64,

    /// Which block of the message this is.
    pub(crate) block_num: u32,

    /// Total number of blocks of the message.
    pub(crate) num_blocks: u32,

    /// Total message size in bytes.
    pub(crate) msg_size: u64,

    /// The block bytes (short for the tail block).
    pub(crate) bytes: Vec<u8>,
}

/// Completion reported to the group owner.
pub(crate) enum RdmcCompletion {
    /// All blocks of my own message have been posted; the message is
    /// locally stable on the sender.
    Sent { size: u64 },

    /// A full message from the group's sender is in place.
    Received { buffer: MessageBuffer, size: u64 },
}

/// Asks the owner for a destination buffer for an incoming message.
pub(crate) type IncomingDestFn =
    Box<dyn FnMut(u64) -> Option<MessageBuffer> + Send>;

/// Reports completions to the owner.
pub(crate) type CompletionFn = Box<dyn FnMut(RdmcCompletion) + Send>;

/// Reports a relay failure (the peer we could not forward to).
pub(crate) type FailureFn = Box<dyn FnMut(Option<NodeId>) + Send>;

struct GroupInfo {
    rotated_members: Vec<NodeId>,
    my_pos: usize,
    block_size: usize,
    algorithm: Algorithm,
}

struct InFlight {
    buffer: MessageBuffer,
    msg_size: u64,
    received: Bitmap,
}

struct GroupState {
    incoming_dest: IncomingDestFn,
    completion: CompletionFn,
    failure: FailureFn,
    in_flight: HashMap<u64, InFlight>,
    next_msg_id: u64,
}

struct RdmcGroup {
    info: Arc<GroupInfo>,
    state: StdMutex<GroupState>,
}

/// The block multicast engine; one per process, shared across views.
pub(crate) struct RdmcEngine {
    me: NodeId,
    fabric: Arc<Fabric<WireMsg>>,
    groups: RwLock<HashMap<RdmcGroupNum, Arc<RdmcGroup>>>,
}

impl RdmcEngine {
    pub(crate) fn new(
        me: NodeId,
        fabric: Arc<Fabric<WireMsg>>,
    ) -> RdmcEngine {
        RdmcEngine {
            me,
            fabric,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a block-transfer group. `rotated_members` must place the
    /// group's sender at position 0 and contain this node.
    pub(crate) fn create_group(
        &self,
        group_num: RdmcGroupNum,
        rotated_members: Vec<NodeId>,
        block_size: usize,
        algorithm: Algorithm,
        incoming_dest: IncomingDestFn,
        completion: CompletionFn,
        failure: FailureFn,
    ) -> Result<(), SquallError> {
        if block_size == 0 {
            return logged_err!(self.me; "invalid block_size 0");
        }
        let my_pos = rotated_members
            .iter()
            .position(|&m| m == self.me)
            .ok_or_else(|| {
                SquallError(format!(
                    "node {} not in group {}",
                    self.me, group_num
                ))
            })?;

        let group = Arc::new(RdmcGroup {
            info: Arc::new(GroupInfo {
                rotated_members,
                my_pos,
                block_size,
                algorithm,
            }),
            state: StdMutex::new(GroupState {
                incoming_dest,
                completion,
                failure,
                in_flight: HashMap::new(),
                next_msg_id: 0,
            }),
        });

        let mut groups = self.groups.write().unwrap();
        if groups.insert(group_num, group).is_some() {
            return logged_err!(self.me;
                               "duplicate group num {}", group_num);
        }
        pf_debug!(self.me; "created block group {}", group_num);
        Ok(())
    }

    /// Destroys a group, returning the destination buffers of any
    /// partially received messages so the owner can reclaim them.
    pub(crate) fn destroy_group(
        &self,
        group_num: RdmcGroupNum,
    ) -> Vec<MessageBuffer> {
        let removed =
            self.groups.write().unwrap().remove(&group_num);
        match removed {
            Some(group) => {
                pf_debug!(self.me;
                          "destroyed block group {}", group_num);
                let mut state = group.state.lock().unwrap();
                state
                    .in_flight
                    .drain()
                    .map(|(_, inflight)| inflight.buffer)
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Sends one message on a group this node is the sender of: slices it
    /// into blocks, posts each block to this position's schedule children,
    /// then reports local stability via the completion upcall.
    ///
    /// Must not be called while holding the owner's message-state lock;
    /// the completion upcall acquires it.
    pub(crate) fn send(
        &self,
        group_num: RdmcGroupNum,
        data: &[u8],
    ) -> Result<(), SquallError> {
        let group = self.lookup(group_num)?;
        let info = &group.info;
        if info.my_pos != 0 {
            return logged_err!(self.me;
                               "not the sender of group {}", group_num);
        }

        let msg_id = {
            let mut state = group.state.lock().unwrap();
            let id = state.next_msg_id;
            state.next_msg_id += 1;
            id
        };

        let n = info.rotated_members.len();
        let num_blocks =
            data.len().div_ceil(info.block_size).max(1) as u32;
        let children = info.algorithm.children(0, n);

        for block_num in 0..num_blocks {
            let beg = block_num as usize * info.block_size;
            let end = (beg + info.block_size).min(data.len());
            let frame = BlockFrame {
                group: group_num,
                msg_id,
                block_num,
                num_blocks,
                msg_size: data.len() as u64,
                bytes: data[beg..end].to_vec(),
            };
            for &child in &children {
                let peer = info.rotated_members[child];
                if let Err(e) =
                    self.fabric.post(peer, WireMsg::Block(frame.clone()))
                {
                    pf_warn!(self.me;
                             "block post to {} failed: {}", peer, e);
                    let mut state = group.state.lock().unwrap();
                    (state.failure)(Some(peer));
                }
            }
        }

        let mut state = group.state.lock().unwrap();
        (state.completion)(RdmcCompletion::Sent {
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Handles one incoming block: places it into the destination buffer,
    /// forwards it along the schedule, and fires the completion upcall
    /// when the message is whole.
    pub(crate) fn on_block(&self, frame: BlockFrame) {
        let group = match self.lookup(frame.group) {
            Ok(g) => g,
            Err(_) => {
                // stale block from a previous view's group
                pf_trace!(self.me;
                          "dropping block for unknown group {}",
                          frame.group);
                return;
            }
        };
        let info = group.info.clone();
        let n = info.rotated_members.len();

        // forward first so the pipeline keeps moving
        for &child in &info.algorithm.children(info.my_pos, n) {
            let peer = info.rotated_members[child];
            if let Err(e) =
                self.fabric.post(peer, WireMsg::Block(frame.clone()))
            {
                pf_warn!(self.me;
                         "block relay to {} failed: {}", peer, e);
                let mut state = group.state.lock().unwrap();
                (state.failure)(Some(peer));
            }
        }

        let mut state = group.state.lock().unwrap();
        if !state.in_flight.contains_key(&frame.msg_id) {
            // first block of this message: ask the owner for a buffer
            match (state.incoming_dest)(frame.msg_size) {
                Some(buffer)
                    if buffer.capacity() as u64 >= frame.msg_size =>
                {
                    state.in_flight.insert(
                        frame.msg_id,
                        InFlight {
                            buffer,
                            msg_size: frame.msg_size,
                            received: Bitmap::new(
                                frame.num_blocks.max(1) as usize,
                            ),
                        },
                    );
                }
                _ => {
                    pf_error!(self.me;
                              "no destination buffer for group {} msg {}",
                              frame.group, frame.msg_id);
                    (state.failure)(None);
                    return;
                }
            }
        }

        let entry =
            state.in_flight.get_mut(&frame.msg_id).unwrap();
        let block_num = frame.block_num as usize;
        if block_num >= entry.received.capacity()
            || entry.received.contains(block_num)
        {
            return; // duplicate or malformed block
        }
        let beg = block_num * info.block_size;
        let end =
            (beg + info.block_size).min(entry.msg_size as usize);
        if end.saturating_sub(beg) != frame.bytes.len() {
            pf_warn!(self.me;
                     "block {} of group {} has bad length {}",
                     block_num, frame.group, frame.bytes.len());
            (state.failure)(None);
            return;
        }
        entry.buffer.as_mut_slice(entry.msg_size as usize)
            [beg..end]
            .copy_from_slice(&frame.bytes);
        entry.received.insert(block_num);

        if entry.received.is_full() {
            let done =
                state.in_flight.remove(&frame.msg_id).unwrap();
            pf_trace!(self.me;
                      "group {} msg {} fully received ({} B)",
                      frame.group, frame.msg_id, done.msg_size);
            (state.completion)(RdmcCompletion::Received {
                buffer: done.buffer,
                size: done.msg_size,
            });
        }
    }

    fn lookup(
        &self,
        group_num: RdmcGroupNum,
    ) -> Result<Arc<RdmcGroup>, SquallError> {
        self.groups
            .read()
            .unwrap()
            .get(&group_num)
            .cloned()
            .ok_or_else(|| {
                SquallError(format!("no group {}", group_num))
            })
    }
}

#[cfg(test)]
mod rdmc_tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn linked_engines() -> Result<
        (
            Arc<Fabric<WireMsg>>,
            Arc<Fabric<WireMsg>>,
            RdmcEngine,
            RdmcEngine,
        ),
        SquallError,
    > {
        let fab_a = Arc::new(
            Fabric::new_and_setup(1, "127.0.0.1:0".parse()?).await?,
        );
        let fab_b = Arc::new(
            Fabric::new_and_setup(2, "127.0.0.1:0".parse()?).await?,
        );
        fab_a.connect_to_peer(2, fab_b.listen_addr()).await?;
        fab_b.wait_for_peers(&[1]).await?;
        let eng_a = RdmcEngine::new(1, fab_a.clone());
        let eng_b = RdmcEngine::new(2, fab_b.clone());
        Ok((fab_a, fab_b, eng_a, eng_b))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn two_node_block_transfer() -> Result<(), SquallError> {
        let (_fab_a, fab_b, eng_a, eng_b) = linked_engines().await?;
        let (tx_done, mut rx_done) = mpsc::unbounded_channel();

        let (tx_sent, mut rx_sent) = mpsc::unbounded_channel();
        eng_a.create_group(
            0,
            vec![1, 2],
            4,
            Algorithm::BinomialSend,
            Box::new(|_| None),
            Box::new(move |c| {
                if let RdmcCompletion::Sent { size } = c {
                    tx_sent.send(size).unwrap();
                }
            }),
            Box::new(|_| panic!("unexpected failure")),
        )?;
        eng_b.create_group(
            0,
            vec![1, 2],
            4,
            Algorithm::BinomialSend,
            Box::new(|size| Some(MessageBuffer::new(size as usize))),
            Box::new(move |c| {
                if let RdmcCompletion::Received { buffer, size } = c {
                    tx_done
                        .send(buffer.as_slice(size as usize).to_vec())
                        .unwrap();
                }
            }),
            Box::new(|_| panic!("unexpected failure")),
        )?;

        let payload: Vec<u8> = (0..10u8).collect(); // 3 blocks of 4
        eng_a.send(0, &payload)?;
        assert_eq!(rx_sent.recv().await, Some(10));

        // route b's incoming block frames into its engine
        let mut rx_b = fab_b.take_receiver();
        tokio::spawn(async move {
            while let Some((_from, msg)) = rx_b.recv().await {
                if let WireMsg::Block(frame) = msg {
                    eng_b.on_block(frame);
                }
            }
        });

        assert_eq!(rx_done.recv().await, Some(payload));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_sender_cannot_send() -> Result<(), SquallError> {
        let (_fab_a, _fab_b, eng_a, _eng_b) =
            linked_engines().await?;
        eng_a.create_group(
            3,
            vec![2, 1], // node 2 is the sender
            8,
            Algorithm::ChainSend,
            Box::new(|size| Some(MessageBuffer::new(size as usize))),
            Box::new(|_| {}),
            Box::new(|_| {}),
        )?;
        assert!(eng_a.send(3, &[0u8; 4]).is_err());
        Ok(())
    }

    #[test]
    fn algorithm_parsing() {
        assert_eq!(
            Algorithm::from_config("binomial_send").unwrap(),
            Algorithm::BinomialSend
        );
        assert_eq!(
            Algorithm::from_config("chain_send").unwrap(),
            Algorithm::ChainSend
        );
        assert!(Algorithm::from_config("quadratic_send").is_err());
    }
}

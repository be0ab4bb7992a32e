//! View descriptors and subgroup layout. A view is an immutable snapshot
//! of group membership; the flat subgroup ID space enumerates all shards
//! of all subgroup types and doubles as the column index into per-subgroup
//! SST arrays.

pub(crate) mod manager;

use std::net::SocketAddr;

use crate::sst::{ChangeKind, ChangeProposal, MemberRank};
use crate::utils::SquallError;
use crate::{NodeId, SubgroupId};

use serde::{Deserialize, Serialize};

/// Delivery mode of a shard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum Mode {
    /// Totally-ordered atomic multicast.
    Ordered,

    /// Per-sender FIFO only; delivery happens on receipt.
    Raw,
}

/// Listen addresses of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddrs {
    /// Row-write fabric listener.
    pub fabric: SocketAddr,

    /// Membership-service (join) listener.
    pub gms: SocketAddr,
}

/// Desired layout of one shard. An empty `members` list means "all view
/// members"; an empty `senders` list means every shard member may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub members: Vec<NodeId>,
    pub senders: Vec<bool>,
    pub mode: Mode,
}

/// All shards of one subgroup type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupTypeSpec {
    pub name: String,
    pub shards: Vec<ShardSpec>,
}

/// The group's declared subgroup layout policy. Fixed for the lifetime of
/// the group; membership within shards follows the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupSpec {
    pub types: Vec<SubgroupTypeSpec>,
}

impl SubgroupSpec {
    /// A single subgroup type with one shard spanning every view member,
    /// everyone a sender.
    pub fn one_shard_of_everyone(
        name: impl Into<String>,
        mode: Mode,
    ) -> SubgroupSpec {
        SubgroupSpec {
            types: vec![SubgroupTypeSpec {
                name: name.into(),
                shards: vec![ShardSpec {
                    members: Vec::new(),
                    senders: Vec::new(),
                    mode,
                }],
            }],
        }
    }
}

/// Provisioned layout of one shard within a concrete view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    /// Name of the subgroup type this shard belongs to.
    pub type_name: String,

    /// Shard index within its type.
    pub shard_index: usize,

    /// Live members of the shard, in provisioning order.
    pub members: Vec<NodeId>,

    /// Parallel sender-allowed flags.
    pub senders: Vec<bool>,

    /// Delivery mode.
    pub mode: Mode,
}

impl ShardLayout {
    /// Number of allowed senders.
    pub fn num_senders(&self) -> usize {
        self.senders.iter().filter(|&&s| s).count()
    }
}

/// State transfer seam for typed subgroups: replicated objects move
/// between members as opaque byte buffers.
pub trait ReplicatedState: Send {
    /// Serializes the full object state.
    fn serialize(&self) -> Result<Vec<u8>, SquallError>;

    /// Replaces the object state from a serialized buffer.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), SquallError>;

    /// Applies one delivered update to the object state.
    fn apply_update(&mut self, bytes: &[u8]) -> Result<(), SquallError>;
}

/// An immutable membership snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// Monotonic view number.
    pub vid: i32,

    /// Member node IDs in rank order, duplicate-free.
    pub members: Vec<NodeId>,

    /// Parallel listen addresses.
    pub member_addrs: Vec<MemberAddrs>,

    /// Parallel suspicion flags; true means the member is gone.
    pub failed: Vec<bool>,

    /// Count of trues in `failed`.
    pub num_failed: usize,

    /// Members that joined relative to the previous view.
    pub joined: Vec<NodeId>,

    /// Members that departed relative to the previous view.
    pub departed: Vec<NodeId>,

    /// This node's rank (row index) in the view.
    pub my_rank: MemberRank,

    /// Flat shard layouts indexed by `SubgroupId`.
    pub subgroup_shards: Vec<ShardLayout>,
}

impl View {
    /// Builds a view from scratch, provisioning shards from the spec.
    pub(crate) fn new(
        vid: i32,
        members: Vec<NodeId>,
        member_addrs: Vec<MemberAddrs>,
        my_id: NodeId,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        spec: &SubgroupSpec,
    ) -> Result<View, SquallError> {
        let mut dedup = members.clone();
        dedup.sort_unstable();
        dedup.dedup();
        if dedup.len() != members.len() {
            return Err(SquallError(
                "view members contain duplicates".into(),
            ));
        }
        let my_rank = members
            .iter()
            .position(|&m| m == my_id)
            .ok_or_else(|| {
                SquallError(format!(
                    "node {} not in view members",
                    my_id
                ))
            })?;
        let subgroup_shards = provision_subgroups(spec, &members);
        Ok(View {
            vid,
            failed: vec![false; members.len()],
            num_failed: 0,
            members,
            member_addrs,
            joined,
            departed,
            my_rank,
            subgroup_shards,
        })
    }

    /// Rank of a node in this view, if a member.
    pub fn rank_of(&self, id: NodeId) -> Option<MemberRank> {
        self.members.iter().position(|&m| m == id)
    }

    /// The leader is the lowest-ranked member not marked failed.
    pub fn leader_rank(&self) -> MemberRank {
        self.failed
            .iter()
            .position(|&f| !f)
            .expect("view cannot have all members failed")
    }

    /// Do I currently lead this view?
    pub fn i_am_leader(&self) -> bool {
        self.leader_rank() == self.my_rank
    }

    /// Ranks of members not marked failed.
    pub fn live_ranks(&self) -> Vec<MemberRank> {
        self.failed
            .iter()
            .enumerate()
            .filter_map(|(r, &f)| if f { None } else { Some(r) })
            .collect()
    }

    /// Marks a member failed; returns true if newly marked.
    pub(crate) fn mark_failed(&mut self, rank: MemberRank) -> bool {
        if !self.failed[rank] {
            self.failed[rank] = true;
            self.num_failed += 1;
            true
        } else {
            false
        }
    }

    /// Constructs the successor view by applying committed membership
    /// changes: departures drop out, joiners append at the end. The
    /// construction is deterministic so every survivor computes the same
    /// view. `my_id` fixes the new `my_rank`.
    pub(crate) fn apply_changes(
        &self,
        changes: &[ChangeProposal],
        my_id: NodeId,
        spec: &SubgroupSpec,
    ) -> Result<View, SquallError> {
        let mut members = Vec::new();
        let mut member_addrs = Vec::new();
        let mut departed = Vec::new();
        let mut joined = Vec::new();

        let departing: Vec<NodeId> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Depart)
            .map(|c| c.node_id)
            .collect();

        for (rank, &m) in self.members.iter().enumerate() {
            if departing.contains(&m) {
                departed.push(m);
            } else {
                members.push(m);
                member_addrs.push(self.member_addrs[rank]);
            }
        }
        for change in changes {
            if change.kind == ChangeKind::Join
                && !members.contains(&change.node_id)
            {
                members.push(change.node_id);
                member_addrs.push(MemberAddrs {
                    fabric: change.joiner_fabric_addr.ok_or_else(
                        || {
                            SquallError(
                                "join change missing fabric addr"
                                    .into(),
                            )
                        },
                    )?,
                    gms: change.joiner_gms_addr.ok_or_else(|| {
                        SquallError(
                            "join change missing gms addr".into(),
                        )
                    })?,
                });
                joined.push(change.node_id);
            }
        }

        View::new(
            self.vid + 1,
            members,
            member_addrs,
            my_id,
            joined,
            departed,
            spec,
        )
    }
}

/// Computes the flat shard layouts for a member list. Shard membership is
/// the spec's member list filtered to view members (in spec order), or all
/// view members for an empty spec list.
pub(crate) fn provision_subgroups(
    spec: &SubgroupSpec,
    members: &[NodeId],
) -> Vec<ShardLayout> {
    let mut shards = Vec::new();
    for type_spec in &spec.types {
        for (shard_index, shard_spec) in
            type_spec.shards.iter().enumerate()
        {
            let (shard_members, senders): (Vec<NodeId>, Vec<bool>) =
                if shard_spec.members.is_empty() {
                    (
                        members.to_vec(),
                        vec![true; members.len()],
                    )
                } else {
                    shard_spec
                        .members
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| members.contains(m))
                        .map(|(i, &m)| {
                            let sender = shard_spec
                                .senders
                                .get(i)
                                .copied()
                                .unwrap_or(true);
                            (m, sender)
                        })
                        .unzip()
                };
            shards.push(ShardLayout {
                type_name: type_spec.name.clone(),
                shard_index,
                members: shard_members,
                senders,
                mode: shard_spec.mode,
            });
        }
    }
    shards
}

/// Per-subgroup settings derived from a view for the multicast core.
#[derive(Debug, Clone)]
pub(crate) struct SubgroupSettings {
    /// Shard member node IDs.
    pub(crate) members: Vec<NodeId>,

    /// Shard members' ranks (row indices) in the view.
    pub(crate) member_ranks: Vec<MemberRank>,

    /// Parallel sender-allowed flags.
    pub(crate) senders: Vec<bool>,

    /// My index within the shard, if a member.
    pub(crate) my_shard_rank: Option<usize>,

    /// My index among the shard's senders, if one of them.
    pub(crate) my_sender_rank: Option<usize>,

    /// Number of allowed senders.
    pub(crate) num_senders: usize,

    /// First `num_received` column of this subgroup.
    pub(crate) num_received_offset: u32,

    /// Delivery mode.
    pub(crate) mode: Mode,
}

impl SubgroupSettings {
    /// Rank of a node among the shard's allowed senders, if it is one.
    pub(crate) fn sender_rank_of(
        &self,
        id: NodeId,
    ) -> Option<usize> {
        let shard_rank =
            self.members.iter().position(|&m| m == id)?;
        if self.senders[shard_rank] {
            Some(
                self.senders[..shard_rank]
                    .iter()
                    .filter(|&&s| s)
                    .count(),
            )
        } else {
            None
        }
    }

    /// Shard ranks indexed by sender rank.
    pub(crate) fn shard_ranks_by_sender_rank(&self) -> Vec<usize> {
        self.senders
            .iter()
            .enumerate()
            .filter_map(|(sr, &s)| if s { Some(sr) } else { None })
            .collect()
    }
}

impl View {
    /// Derives the multicast core's per-subgroup settings, plus the total
    /// number of `num_received` columns.
    pub(crate) fn subgroup_settings(
        &self,
    ) -> (Vec<SubgroupSettings>, u32) {
        let mut settings = Vec::new();
        let mut offset = 0u32;
        for shard in &self.subgroup_shards {
            let member_ranks: Vec<MemberRank> = shard
                .members
                .iter()
                .map(|&m| {
                    self.rank_of(m)
                        .expect("shard member must be in view")
                })
                .collect();
            let my_shard_rank = shard
                .members
                .iter()
                .position(|&m| m == self.members[self.my_rank]);
            let my_sender_rank = my_shard_rank.and_then(|sr| {
                if shard.senders[sr] {
                    Some(
                        shard.senders[..sr]
                            .iter()
                            .filter(|&&s| s)
                            .count(),
                    )
                } else {
                    None
                }
            });
            let num_senders = shard.num_senders();
            settings.push(SubgroupSettings {
                members: shard.members.clone(),
                member_ranks,
                senders: shard.senders.clone(),
                my_shard_rank,
                my_sender_rank,
                num_senders,
                num_received_offset: offset,
                mode: shard.mode,
            });
            offset += num_senders as u32;
        }
        (settings, offset)
    }

    /// Number of subgroups (flat shard count) in this view.
    pub fn num_subgroups(&self) -> usize {
        self.subgroup_shards.len()
    }

    /// The shard layout of a subgroup.
    pub fn shard(&self, subgroup: SubgroupId) -> &ShardLayout {
        &self.subgroup_shards[subgroup as usize]
    }
}

#[cfg(test)]
mod view_tests {
    use super::*;

    fn addrs(n: usize) -> Vec<MemberAddrs> {
        (0..n)
            .map(|i| MemberAddrs {
                fabric: format!("127.0.0.1:{}", 7000 + i)
                    .parse()
                    .unwrap(),
                gms: format!("127.0.0.1:{}", 8000 + i)
                    .parse()
                    .unwrap(),
            })
            .collect()
    }

    fn three_member_view() -> View {
        View::new(
            0,
            vec![10, 20, 30],
            addrs(3),
            20,
            vec![],
            vec![],
            &SubgroupSpec::one_shard_of_everyone("chat", Mode::Ordered),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_members_rejected() {
        assert!(View::new(
            0,
            vec![1, 2, 1],
            addrs(3),
            1,
            vec![],
            vec![],
            &SubgroupSpec::one_shard_of_everyone("x", Mode::Raw),
        )
        .is_err());
    }

    #[test]
    fn leader_is_lowest_live_rank() {
        let mut view = three_member_view();
        assert_eq!(view.leader_rank(), 0);
        assert!(!view.i_am_leader()); // I am node 20, rank 1
        view.mark_failed(0);
        assert_eq!(view.leader_rank(), 1);
        assert!(view.i_am_leader());
        assert_eq!(view.live_ranks(), vec![1, 2]);
    }

    #[test]
    fn provision_everyone_shard() {
        let view = three_member_view();
        assert_eq!(view.num_subgroups(), 1);
        let shard = view.shard(0);
        assert_eq!(shard.members, vec![10, 20, 30]);
        assert_eq!(shard.senders, vec![true, true, true]);
        assert_eq!(shard.num_senders(), 3);
    }

    #[test]
    fn provision_filters_to_view_members() {
        let spec = SubgroupSpec {
            types: vec![SubgroupTypeSpec {
                name: "kv".into(),
                shards: vec![ShardSpec {
                    members: vec![30, 10, 99],
                    senders: vec![true, false, true],
                    mode: Mode::Ordered,
                }],
            }],
        };
        let shards = provision_subgroups(&spec, &[10, 20, 30]);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].members, vec![30, 10]);
        assert_eq!(shards[0].senders, vec![true, false]);
    }

    #[test]
    fn subgroup_settings_sender_ranks() {
        let spec = SubgroupSpec {
            types: vec![SubgroupTypeSpec {
                name: "kv".into(),
                shards: vec![ShardSpec {
                    members: vec![10, 20, 30],
                    senders: vec![false, true, true],
                    mode: Mode::Ordered,
                }],
            }],
        };
        let view = View::new(
            0,
            vec![10, 20, 30],
            addrs(3),
            30,
            vec![],
            vec![],
            &spec,
        )
        .unwrap();
        let (settings, cols) = view.subgroup_settings();
        assert_eq!(cols, 2);
        assert_eq!(settings[0].my_shard_rank, Some(2));
        assert_eq!(settings[0].my_sender_rank, Some(1));
        assert_eq!(settings[0].num_senders, 2);
        assert_eq!(settings[0].num_received_offset, 0);
    }

    #[test]
    fn apply_changes_join_and_depart() {
        let view = three_member_view();
        let changes = vec![
            ChangeProposal {
                node_id: 20,
                kind: ChangeKind::Depart,
                joiner_fabric_addr: None,
                joiner_gms_addr: None,
            },
            ChangeProposal {
                node_id: 40,
                kind: ChangeKind::Join,
                joiner_fabric_addr: Some(
                    "127.0.0.1:7040".parse().unwrap(),
                ),
                joiner_gms_addr: Some(
                    "127.0.0.1:8040".parse().unwrap(),
                ),
            },
        ];
        let spec =
            SubgroupSpec::one_shard_of_everyone("chat", Mode::Ordered);
        let next =
            view.apply_changes(&changes, 10, &spec).unwrap();
        assert_eq!(next.vid, 1);
        assert_eq!(next.members, vec![10, 30, 40]);
        assert_eq!(next.departed, vec![20]);
        assert_eq!(next.joined, vec![40]);
        assert_eq!(next.my_rank, 0);
        assert!(next.failed.iter().all(|&f| !f));
        // shard re-provisioned over the new membership
        assert_eq!(next.shard(0).members, vec![10, 30, 40]);
    }

    #[test]
    fn view_serde_round_trip() {
        let view = three_member_view();
        let bytes = rmp_serde::encode::to_vec(&view).unwrap();
        let back: View =
            rmp_serde::decode::from_slice(&bytes).unwrap();
        assert_eq!(back, view);
    }
}

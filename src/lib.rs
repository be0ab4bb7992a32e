//! Public interface to the Squall group-communication library.
//!
//! Squall delivers totally-ordered, virtually-synchronous atomic
//! multicast to dynamically-changing groups of nodes. The shared-state
//! table (SST) replaces explicit protocol messages with one-sided row
//! writes; sequence numbers, stability, delivery, and persistence are
//! all derived from SST counters by trigger predicates.

#[macro_use]
pub mod utils;

mod transport;
mod sst;
mod rdmc;
mod multicast;
mod view;
mod persist;
mod group;

pub use group::{
    Group, GroupConfig, StateRegistry, SubgroupHandle,
    DEFAULT_GMS_PORT, DEFAULT_RDMC_PORT, DEFAULT_RPC_PORT,
    DEFAULT_SST_PORT,
};
pub use multicast::{
    CallbackSet, DeliveryFn, PersistenceFn, RpcFn, SendBuffer,
};
pub use persist::PersistedRecord;
pub use rdmc::Algorithm;
pub use utils::SquallError;
pub use view::{
    MemberAddrs, Mode, ReplicatedState, ShardLayout, ShardSpec,
    SubgroupSpec, SubgroupTypeSpec, View,
};

/// Stable identifier of a participating node.
pub type NodeId = u32;

/// Flat identifier enumerating all shards across all subgroup types in
/// a view; also the column index in per-subgroup SST arrays.
pub type SubgroupId = u32;

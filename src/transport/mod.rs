//! Peer-to-peer transport fabric emulating one-sided remote writes between
//! registered memory regions, plus the endpoint-exchange wire format.

mod endpoint;
mod fabric;
mod memory;

pub(crate) use fabric::{Fabric, FabricEvent, WorkId};
pub(crate) use memory::MessageBuffer;

use crate::sst::RowUpdate;
use crate::rdmc::BlockFrame;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// All traffic multiplexed over one fabric connection between two members.
#[derive(Debug, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum WireMsg {
    /// One-sided write of a shared-state table row range.
    Row(RowUpdate),

    /// One block of a pipelined bulk transfer.
    Block(BlockFrame),
}

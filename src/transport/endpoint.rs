//! Endpoint info exchanged when bringing up a reliable-connected pair, and
//! the queue-pair state walk. The exchange blob layout is fixed and sent in
//! network byte order so that both sides agree regardless of host order.

use std::net::SocketAddr;

use crate::utils::SquallError;

/// Size in bytes of the serialized exchange blob:
/// `{addr:64, rkey:32, qp_num:32, lid:16, gid:128}`.
pub(crate) const QP_EXCHANGE_BLOB_SIZE: usize = 8 + 4 + 4 + 2 + 16;

/// Conservative retry constants for the reliable-connected pair. The
/// timeout value is in the device's exponential units (4.096us << timeout).
pub(crate) const QP_TIMEOUT: u8 = 4;
pub(crate) const QP_RETRY_CNT: u8 = 6;
pub(crate) const QP_RNR_RETRY: u8 = 0;

/// States a reliable-connected pair walks through during setup. A pair must
/// reach `ReadyToSend` before any remote write may be posted on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Errored,
}

impl QpState {
    /// Advances to the next setup state; setup order is fixed.
    pub(crate) fn advance(self) -> Result<QpState, SquallError> {
        match self {
            QpState::Reset => Ok(QpState::Init),
            QpState::Init => Ok(QpState::ReadyToReceive),
            QpState::ReadyToReceive => Ok(QpState::ReadyToSend),
            s => Err(SquallError(format!(
                "cannot advance pair state {:?}",
                s
            ))),
        }
    }
}

/// Connection data exchanged over TCP to connect a pair of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QpEndpoint {
    /// Base address of the remote-writable region.
    pub(crate) addr: u64,

    /// Remote access key for that region.
    pub(crate) rkey: u32,

    /// Pair number, unique per device.
    pub(crate) qp_num: u32,

    /// Local identifier of the port.
    pub(crate) lid: u16,

    /// Global identifier of the port.
    pub(crate) gid: [u8; 16],
}

impl QpEndpoint {
    /// Derives endpoint info for this process's listener. Without a real
    /// device the region address and key are synthesized from the socket
    /// address; the gid carries the IPv6-mapped listen address.
    pub(crate) fn from_listener(
        addr: SocketAddr,
        qp_num: u32,
        region_base: u64,
        rkey: u32,
    ) -> QpEndpoint {
        let ip6 = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            std::net::IpAddr::V6(v6) => v6,
        };
        QpEndpoint {
            addr: region_base,
            rkey,
            qp_num,
            lid: addr.port(),
            gid: ip6.octets(),
        }
    }

    /// Serializes into the fixed-size exchange blob, network byte order.
    pub(crate) fn to_blob(&self) -> [u8; QP_EXCHANGE_BLOB_SIZE] {
        let mut blob = [0u8; QP_EXCHANGE_BLOB_SIZE];
        blob[0..8].copy_from_slice(&self.addr.to_be_bytes());
        blob[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        blob[12..16].copy_from_slice(&self.qp_num.to_be_bytes());
        blob[16..18].copy_from_slice(&self.lid.to_be_bytes());
        blob[18..34].copy_from_slice(&self.gid);
        blob
    }

    /// Parses the fixed-size exchange blob.
    pub(crate) fn from_blob(
        blob: &[u8],
    ) -> Result<QpEndpoint, SquallError> {
        if blob.len() != QP_EXCHANGE_BLOB_SIZE {
            return Err(SquallError(format!(
                "invalid exchange blob length {}",
                blob.len()
            )));
        }
        Ok(QpEndpoint {
            addr: u64::from_be_bytes(blob[0..8].try_into().unwrap()),
            rkey: u32::from_be_bytes(blob[8..12].try_into().unwrap()),
            qp_num: u32::from_be_bytes(blob[12..16].try_into().unwrap()),
            lid: u16::from_be_bytes(blob[16..18].try_into().unwrap()),
            gid: blob[18..34].try_into().unwrap(),
        })
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;

    #[test]
    fn blob_round_trip() -> Result<(), SquallError> {
        let ep = QpEndpoint {
            addr: 0xdead_beef_cafe_0123,
            rkey: 0x1122_3344,
            qp_num: 77,
            lid: 18361,
            gid: [7; 16],
        };
        let blob = ep.to_blob();
        assert_eq!(blob.len(), QP_EXCHANGE_BLOB_SIZE);
        assert_eq!(QpEndpoint::from_blob(&blob)?, ep);
        Ok(())
    }

    #[test]
    fn blob_network_order() {
        let ep = QpEndpoint {
            addr: 1,
            rkey: 2,
            qp_num: 3,
            lid: 4,
            gid: [0; 16],
        };
        let blob = ep.to_blob();
        // big-endian: the least significant byte comes last in each field
        assert_eq!(blob[7], 1);
        assert_eq!(blob[11], 2);
        assert_eq!(blob[15], 3);
        assert_eq!(blob[17], 4);
    }

    #[test]
    fn blob_bad_length() {
        assert!(QpEndpoint::from_blob(&[0u8; 16]).is_err());
    }

    #[test]
    fn state_walk() -> Result<(), SquallError> {
        let mut state = QpState::Reset;
        for expect in [
            QpState::Init,
            QpState::ReadyToReceive,
            QpState::ReadyToSend,
        ] {
            state = state.advance()?;
            assert_eq!(state, expect);
        }
        assert!(state.advance().is_err());
        Ok(())
    }
}

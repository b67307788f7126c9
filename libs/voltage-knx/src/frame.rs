//! knxd client protocol framing
//!
//! Every message is `[size:2][type:2][payload...]` where `size` counts the type
//! field plus the payload, but not itself.

use crate::address::GroupAddress;
use crate::telegram::FrameError;

pub const EIB_CLOSE: u16 = 0x0006;
pub const EIB_OPEN_VBUSMONITOR: u16 = 0x0012;
pub const EIB_VBUSMONITOR_PACKET: u16 = 0x0014;
pub const EIB_OPEN_T_GROUP: u16 = 0x0022;
pub const EIB_APDU_PACKET: u16 = 0x0025;
pub const EIB_OPEN_GROUPCON: u16 = 0x0026;
pub const EIB_GROUP_PACKET: u16 = 0x0027;

/// Size prefix length
pub const HEADER_LEN: usize = 2;

/// Upper bound on the size field; knxd never sends more than a few hundred bytes
pub const MAX_FRAME_SIZE: usize = 1024;

/// One knxd protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnxdFrame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl KnxdFrame {
    pub fn new(msg_type: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Group-socket open request (`EIB_OPEN_GROUPCON` with three reserved bytes)
    pub fn open_groupcon() -> Self {
        Self::new(EIB_OPEN_GROUPCON, [0x00, 0x00, 0x00])
    }

    /// Virtual bus monitor open request; knxd then forwards every L_Data
    /// frame on the bus as `EIB_VBUSMONITOR_PACKET`
    pub fn open_vbusmonitor() -> Self {
        Self::new(EIB_OPEN_VBUSMONITOR, Vec::new())
    }

    /// Group transport connection to a single address, used for bus probes
    pub fn open_t_group(ga: GroupAddress) -> Self {
        let [hi, lo] = ga.to_bytes();
        Self::new(EIB_OPEN_T_GROUP, [hi, lo, 0xFF])
    }

    /// `A_GroupValue_Read` APDU on an open group transport connection
    pub fn apdu_group_read() -> Self {
        Self::new(EIB_APDU_PACKET, [0x00, 0x00])
    }

    pub fn close() -> Self {
        Self::new(EIB_CLOSE, Vec::new())
    }

    /// Total encoded length including the size prefix
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + 2 + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let size = (2 + self.payload.len()) as u16;
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Read the declared frame length (including the prefix) from a buffer head
    ///
    /// Returns `Ok(None)` while fewer than two bytes are available.
    pub fn peek_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if size < 2 {
            return Err(FrameError::Malformed(format!("size field {} below minimum", size)));
        }
        if size > MAX_FRAME_SIZE {
            return Err(FrameError::Malformed(format!(
                "size field {} exceeds maximum {}",
                size, MAX_FRAME_SIZE
            )));
        }
        Ok(Some(HEADER_LEN + size))
    }

    /// Decode one complete frame from the head of `buf`
    ///
    /// The length prefix is validated before the type field is looked at; a
    /// buffer shorter than the declared size is [`FrameError::Truncated`].
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        let total = Self::peek_len(buf)?.ok_or(FrameError::Truncated {
            needed: HEADER_LEN,
            actual: buf.len(),
        })?;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                actual: buf.len(),
            });
        }
        let msg_type = u16::from_be_bytes([buf[2], buf[3]]);
        Ok((Self::new(msg_type, &buf[4..total]), total))
    }
}

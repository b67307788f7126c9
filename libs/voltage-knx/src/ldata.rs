//! L_Data frames as delivered by knxd's bus monitor
//!
//! ```text
//! [ctrl:1][src:2][dst:2][npci:1][tpci:1][apci|data...][checksum]
//! ```
//!
//! Bit 7 of the NPCI byte marks a group destination, bits 4-6 are the hop
//! count and the low nibble is the TPDU length minus one. Bytes past the
//! declared TPDU (the frame checksum) are not kept.

use crate::address::{GroupAddress, IndividualAddress};
use crate::telegram::{Apci, FrameError, Telegram};

/// ctrl + src + dst + npci + tpci
pub const MIN_LDATA_LEN: usize = 7;

const STANDARD_FRAME: u8 = 0x80;
const GROUP_DESTINATION: u8 = 0x80;
const HOP_MASK: u8 = 0x70;
const LENGTH_MASK: u8 = 0x0F;
const TPDU_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Group(GroupAddress),
    Individual(IndividualAddress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LDataFrame {
    pub control: u8,
    pub source: IndividualAddress,
    pub destination: Destination,
    pub hop_count: u8,
    /// TPCI byte onwards
    pub tpdu: Vec<u8>,
}

impl LDataFrame {
    /// Decode a standard frame; extended frames are [`FrameError::Unsupported`]
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_LDATA_LEN {
            return Err(FrameError::Truncated {
                needed: MIN_LDATA_LEN,
                actual: bytes.len(),
            });
        }
        let control = bytes[0];
        if control & STANDARD_FRAME == 0 {
            return Err(FrameError::Unsupported(format!(
                "extended L_Data frame (ctrl 0x{:02X})",
                control
            )));
        }

        let npci = bytes[5];
        let end = TPDU_OFFSET + (npci & LENGTH_MASK) as usize + 1;
        if bytes.len() < end {
            return Err(FrameError::Truncated {
                needed: end,
                actual: bytes.len(),
            });
        }

        let dst = [bytes[3], bytes[4]];
        let destination = if npci & GROUP_DESTINATION != 0 {
            Destination::Group(GroupAddress::from_bytes(dst))
        } else {
            Destination::Individual(IndividualAddress::from_bytes(dst))
        };

        Ok(Self {
            control,
            source: IndividualAddress::from_bytes([bytes[1], bytes[2]]),
            destination,
            hop_count: (npci & HOP_MASK) >> 4,
            tpdu: bytes[TPDU_OFFSET..end].to_vec(),
        })
    }

    /// Group destination, except the 0/0/0 broadcast
    pub fn group_address(&self) -> Option<GroupAddress> {
        match self.destination {
            Destination::Group(ga) if ga.raw() != 0 => Some(ga),
            _ => None,
        }
    }

    /// The group value telegram this frame carries, if it carries one
    pub fn telegram(&self) -> Option<Telegram> {
        let ga = self.group_address()?;
        let mut packet = Vec::with_capacity(4 + self.tpdu.len());
        packet.extend_from_slice(&self.source.to_bytes());
        packet.extend_from_slice(&ga.to_bytes());
        packet.extend_from_slice(&self.tpdu);
        Telegram::decode(&packet).ok()
    }

    pub fn is_group_response(&self) -> bool {
        self.telegram().is_some_and(|t| t.apci == Apci::Response)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::telegram::Payload;

    #[test]
    fn test_decode_group_write_drops_checksum() {
        // 1.1.5 -> 1/0/1 write 1, hop count 6, trailing checksum
        let bytes = [0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x00, 0x81, 0x3A];
        let frame = LDataFrame::decode(&bytes).unwrap();
        assert_eq!(frame.source.to_string(), "1.1.5");
        assert_eq!(frame.destination, Destination::Group("1/0/1".parse().unwrap()));
        assert_eq!(frame.hop_count, 6);
        assert_eq!(frame.tpdu, vec![0x00, 0x81]);

        let telegram = frame.telegram().unwrap();
        assert_eq!(telegram.apci, Apci::Write);
        assert_eq!(telegram.payload, Payload::Short(1));
        assert!(!frame.is_group_response());
    }

    #[test]
    fn test_decode_group_response() {
        let bytes = [0xBC, 0x11, 0x06, 0x08, 0x05, 0xE3, 0x00, 0x40, 0x0C, 0x1A];
        let frame = LDataFrame::decode(&bytes).unwrap();
        assert!(frame.is_group_response());
        assert_eq!(frame.telegram().unwrap().payload.data(), vec![0x0C, 0x1A]);
    }

    #[test]
    fn test_individual_destination_has_no_telegram() {
        // 1.1.1 -> 1.1.20 DeviceDescriptor_Read
        let bytes = [0xB0, 0x11, 0x01, 0x11, 0x14, 0x61, 0x43, 0x00];
        let frame = LDataFrame::decode(&bytes).unwrap();
        assert_eq!(
            frame.destination,
            Destination::Individual("1.1.20".parse().unwrap())
        );
        assert_eq!(frame.group_address(), None);
        assert!(frame.telegram().is_none());
    }

    #[test]
    fn test_broadcast_and_non_group_services() {
        // Broadcast to 0/0/0
        let frame = LDataFrame::decode(&[0xBC, 0x11, 0x05, 0x00, 0x00, 0xE1, 0x00, 0x81]).unwrap();
        assert_eq!(frame.group_address(), None);

        // Group destination but a memory service in the TPCI bits
        let frame = LDataFrame::decode(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x02, 0x00]).unwrap();
        assert!(frame.group_address().is_some());
        assert!(frame.telegram().is_none());
    }

    #[test]
    fn test_short_and_extended_frames_rejected() {
        assert!(matches!(
            LDataFrame::decode(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1]),
            Err(FrameError::Truncated { needed: 7, actual: 6 })
        ));
        // Declared TPDU of three bytes, only two present
        assert!(matches!(
            LDataFrame::decode(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE2, 0x00, 0x80]),
            Err(FrameError::Truncated { needed: 9, actual: 8 })
        ));
        assert!(matches!(
            LDataFrame::decode(&[0x3C, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x00, 0x81]),
            Err(FrameError::Unsupported(_))
        ));
    }
}

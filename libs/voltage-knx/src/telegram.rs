//! Group telegram codec
//!
//! Wire layout of a group packet as exchanged with knxd in group-socket mode:
//!
//! ```text
//! inbound:  [src:2][dst:2][tpci:1][apci|short:1][data...]
//! outbound:        [dst:2][tpci:1][apci|short:1][data...]
//! ```
//!
//! The two high bits of the APCI byte carry the service, the low six bits carry
//! a "short" value (used by 1-6 bit datapoints). Longer values follow as extra
//! bytes with the short field zeroed.

use crate::address::{GroupAddress, IndividualAddress};
use std::fmt;
use thiserror::Error;

/// Minimum inbound group packet: src + dst + tpci + apci
pub const MIN_GROUP_PACKET_LEN: usize = 6;

/// Largest value that fits in the short (6-bit) field
pub const MAX_SHORT_VALUE: u8 = 0x3F;

const APCI_MASK: u8 = 0xC0;
const SHORT_MASK: u8 = 0x3F;
// Low two TPCI bits are the upper APCI bits of non group-value services
const TPCI_APCI_MASK: u8 = 0x03;

/// Frame-level decode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the frame needs
    #[error("Truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Well-formed, but a service this codec does not handle
    #[error("Unsupported frame: {0}")]
    Unsupported(String),

    /// Structurally invalid (bad length field, etc.)
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Application-layer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Apci {
    Read,
    Response,
    Write,
}

impl Apci {
    pub const fn bits(self) -> u8 {
        match self {
            Apci::Read => 0x00,
            Apci::Response => 0x40,
            Apci::Write => 0x80,
        }
    }

    pub fn from_bits(byte: u8) -> Result<Self, FrameError> {
        match byte & APCI_MASK {
            0x00 => Ok(Apci::Read),
            0x40 => Ok(Apci::Response),
            0x80 => Ok(Apci::Write),
            other => Err(FrameError::Unsupported(format!("APCI 0x{:02X}", other))),
        }
    }
}

impl fmt::Display for Apci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Apci::Read => "read",
            Apci::Response => "response",
            Apci::Write => "write",
        };
        f.write_str(name)
    }
}

/// Telegram payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    /// No value (group read request)
    Empty,
    /// Value packed into the low six bits of the APCI byte
    Short(u8),
    /// Value carried in bytes following the APCI byte
    Long(Vec<u8>),
}

impl Payload {
    /// Payload bytes as seen by the datapoint codecs
    pub fn data(&self) -> Vec<u8> {
        match self {
            Payload::Empty => Vec::new(),
            Payload::Short(v) => vec![*v],
            Payload::Long(bytes) => bytes.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// A single group telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub source: IndividualAddress,
    pub destination: GroupAddress,
    /// Transport control byte, kept verbatim so re-encoding is byte-exact
    pub tpci: u8,
    pub apci: Apci,
    pub payload: Payload,
}

impl Telegram {
    /// Group value write
    ///
    /// Encoded-value bytes go into the short field only when `short` is set and
    /// the value is a single byte not above [`MAX_SHORT_VALUE`]; otherwise the
    /// length-extended form is used.
    pub fn write(destination: GroupAddress, data: &[u8], short: bool) -> Self {
        Self::with_value(Apci::Write, destination, data, short)
    }

    /// Group value response
    pub fn response(destination: GroupAddress, data: &[u8], short: bool) -> Self {
        Self::with_value(Apci::Response, destination, data, short)
    }

    /// Group value read request
    pub fn read(destination: GroupAddress) -> Self {
        Self {
            source: IndividualAddress::default(),
            destination,
            tpci: 0,
            apci: Apci::Read,
            payload: Payload::Empty,
        }
    }

    fn with_value(apci: Apci, destination: GroupAddress, data: &[u8], short: bool) -> Self {
        let payload = match data {
            [v] if short && *v <= MAX_SHORT_VALUE => Payload::Short(*v),
            _ => Payload::Long(data.to_vec()),
        };
        Self {
            source: IndividualAddress::default(),
            destination,
            tpci: 0,
            apci,
            payload,
        }
    }

    /// Decode an inbound group packet (`src dst tpci apci [data]`)
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_GROUP_PACKET_LEN {
            return Err(FrameError::Truncated {
                needed: MIN_GROUP_PACKET_LEN,
                actual: bytes.len(),
            });
        }

        let source = IndividualAddress::from_bytes([bytes[0], bytes[1]]);
        let destination = GroupAddress::from_bytes([bytes[2], bytes[3]]);
        let tpci = bytes[4];
        let apci_byte = bytes[5];

        if tpci & TPCI_APCI_MASK != 0 {
            return Err(FrameError::Unsupported(format!(
                "non group-value service (tpci 0x{:02X})",
                tpci
            )));
        }
        let apci = Apci::from_bits(apci_byte)?;
        let short = apci_byte & SHORT_MASK;
        let data = &bytes[MIN_GROUP_PACKET_LEN..];

        let payload = match (apci, data.is_empty()) {
            (Apci::Read, true) if short == 0 => Payload::Empty,
            (Apci::Read, _) => {
                return Err(FrameError::Unsupported(
                    "group read carrying a value".to_string(),
                ))
            },
            (_, true) => Payload::Short(short),
            (_, false) if short != 0 => {
                return Err(FrameError::Unsupported(
                    "extended value with non-zero short field".to_string(),
                ))
            },
            (_, false) => Payload::Long(data.to_vec()),
        };

        Ok(Self {
            source,
            destination,
            tpci,
            apci,
            payload,
        })
    }

    /// Encode as an inbound group packet; inverse of [`Telegram::decode`]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_GROUP_PACKET_LEN + self.long_len());
        out.extend_from_slice(&self.source.to_bytes());
        self.encode_apdu_into(&mut out);
        out
    }

    /// Encode for sending to knxd (destination + APDU, no source)
    pub fn encode_outbound(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_GROUP_PACKET_LEN - 2 + self.long_len());
        self.encode_apdu_into(&mut out);
        out
    }

    fn encode_apdu_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.destination.to_bytes());
        out.push(self.tpci);
        match &self.payload {
            Payload::Empty => out.push(self.apci.bits()),
            Payload::Short(v) => out.push(self.apci.bits() | (v & SHORT_MASK)),
            Payload::Long(bytes) => {
                out.push(self.apci.bits());
                out.extend_from_slice(bytes);
            },
        }
    }

    fn long_len(&self) -> usize {
        match &self.payload {
            Payload::Long(bytes) => bytes.len(),
            _ => 0,
        }
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {} {:02X?}",
            self.source,
            self.destination,
            self.apci,
            self.payload.data()
        )
    }
}

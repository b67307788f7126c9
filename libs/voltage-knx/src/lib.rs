//! voltage-knx - KNX codecs for VoltageEMS
//!
//! Stateless building blocks shared by the KNX bridge service:
//!
//! - **Addresses**: three-level / two-level group addresses, individual addresses
//! - **Telegrams**: group value read/write/response frames with the short
//!   (6-bit) and length-extended payload forms
//! - **L_Data frames**: full bus frames from knxd's bus monitor
//! - **knxd framing**: the `[size][type][payload]` envelope of the knxd client protocol
//! - **Datapoint types**: per-DPT payload validation and scaling
//! - **Canonical functions**: function-name normalisation, default DPTs and flags
//!
//! # Example
//!
//! ```rust
//! use voltage_knx::{decode_value, Dpt, DptValue, Telegram};
//!
//! let telegram = Telegram::decode(&[0x11, 0x01, 0x08, 0x01, 0x00, 0x81]).unwrap();
//! assert_eq!(telegram.destination.to_string(), "1/0/1");
//!
//! let value = decode_value(Dpt::SWITCH, &telegram.payload.data()).unwrap();
//! assert_eq!(value, DptValue::Bool(true));
//! ```

pub mod address;
pub mod dpt;
pub mod frame;
pub mod functions;
pub mod ldata;
pub mod telegram;

pub use address::{AddressError, GroupAddress, IndividualAddress};
pub use dpt::{decode_value, encode_value, Dpt, DptError, DptValue, HvacMode};
pub use frame::KnxdFrame;
pub use functions::{
    infer_dpt, infer_flags, normalize_channel_function, normalize_function,
    state_key_for_function, CanonicalFunction, ChannelFunction, FunctionFlags, UnknownFunction,
};
pub use ldata::{Destination, LDataFrame};
pub use telegram::{Apci, FrameError, Payload, Telegram};

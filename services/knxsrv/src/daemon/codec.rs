//! `tokio_util` codec for the knxd length-prefixed envelope

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use voltage_knx::frame::HEADER_LEN;
use voltage_knx::KnxdFrame;

use crate::error::KnxSrvError;

#[derive(Debug, Default, Clone, Copy)]
pub struct KnxdCodec;

impl Decoder for KnxdCodec {
    type Item = KnxdFrame;
    type Error = KnxSrvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = KnxdFrame::peek_len(src)? else {
            return Ok(None);
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(HEADER_LEN);
        let msg_type = frame.get_u16();
        Ok(Some(KnxdFrame::new(msg_type, frame.to_vec())))
    }
}

impl Encoder<KnxdFrame> for KnxdCodec {
    type Error = KnxSrvError;

    fn encode(&mut self, item: KnxdFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = 2 + item.payload.len();
        if size > voltage_knx::frame::MAX_FRAME_SIZE {
            return Err(KnxSrvError::protocol(format!(
                "frame of {} bytes exceeds knxd maximum",
                size
            )));
        }
        dst.reserve(HEADER_LEN + size);
        dst.put_u16(size as u16);
        dst.put_u16(item.msg_type);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

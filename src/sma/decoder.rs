use crate::prelude::*;
use crate::sma::packet::{BLUETOOTH_HEADER_LEN, BLUETOOTH_MAX_FRAME, DELIMITER};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Splits a serial byte stream into link-layer frames.
///
/// Frames are cut by the length field in the link header rather than by
/// scanning for delimiters, because the unescaped checksum may itself be 0x7E.
pub struct SerialFrameDecoder;

impl SerialFrameDecoder {
    pub fn new() -> Self {
        Self {}
    }

    // drop bytes up to the next plausible start of frame
    fn resync(src: &mut BytesMut) {
        let skip = src[1..]
            .iter()
            .position(|b| *b == DELIMITER)
            .map(|p| p + 1)
            .unwrap_or(src.len());
        debug!("discarding {} bytes to resync", skip);
        src.advance(skip);
    }
}

impl Default for SerialFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SerialFrameDecoder {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }

            if src[0] != DELIMITER {
                Self::resync(src);
                continue;
            }

            if src.len() < 4 {
                return Ok(None);
            }

            let len = u16::from_le_bytes([src[1], src[2]]) as usize;
            if src[0] ^ src[1] ^ src[2] != src[3]
                || !(BLUETOOTH_HEADER_LEN..=BLUETOOTH_MAX_FRAME).contains(&len)
            {
                Self::resync(src);
                continue;
            }

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            return Ok(Some(src.split_to(len).to_vec()));
        }
    }
}

//! Newline framing over a growing byte buffer.
//!
//! Socket reads arrive in arbitrary chunks. Complete frames are cut off
//! the front of the buffer and decoded; a partial trailing frame stays
//! buffered for the next read. A frame that fails to decode is logged
//! and dropped, and decoding continues with the next one.

use bytes::BytesMut;
use relay_core::Envelope;
use tracing::warn;

use crate::json_codec::decode_envelope;
use crate::wire_types::{DEFAULT_MAX_FRAME_LEN, FRAME_DELIMITER};

/// Decode every complete frame in `buf`, leaving the partial tail behind.
pub fn extract_frames(buf: &mut BytesMut) -> Vec<Envelope> {
    extract_limited(buf, usize::MAX)
}

fn extract_limited(buf: &mut BytesMut, max_frame_len: usize) -> Vec<Envelope> {
    let mut envelopes = Vec::new();

    while let Some(pos) = buf.iter().position(|&b| b == FRAME_DELIMITER) {
        let frame = buf.split_to(pos + 1);
        let payload = &frame[..pos];

        if payload.len() > max_frame_len {
            warn!(len = payload.len(), max = max_frame_len, "dropping oversized frame");
            continue;
        }

        if let Some(env) = decode_frame(payload) {
            envelopes.push(env);
        }
    }

    envelopes
}

fn decode_frame(payload: &[u8]) -> Option<Envelope> {
    let payload = payload.strip_suffix(b"\r").unwrap_or(payload);
    if payload.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match decode_envelope(payload) {
        Ok(env) => Some(env),
        Err(err) => {
            warn!(error = %err, len = payload.len(), "dropping malformed frame");
            None
        }
    }
}

/// Per-connection frame decoder with a bound on buffered bytes.
///
/// When a partial frame grows past `max_frame_len` the buffered bytes
/// are thrown away and everything up to the next delimiter is skipped.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
            discarding: false,
        }
    }

    /// Append one socket read and return the envelopes it completed.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<Envelope> {
        if self.discarding {
            match data.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(pos) => {
                    self.discarding = false;
                    data = &data[pos + 1..];
                }
                None => return Vec::new(),
            }
        }

        self.buf.extend_from_slice(data);
        let envelopes = extract_limited(&mut self.buf, self.max_frame_len);

        if self.buf.len() > self.max_frame_len {
            warn!(
                buffered = self.buf.len(),
                max = self.max_frame_len,
                "frame exceeds limit, skipping to next delimiter"
            );
            self.buf.clear();
            self.discarding = true;
        }

        envelopes
    }

    /// Bytes of the current partial frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN: &[u8] = b"{\"command\":\"login\",\"username\":\"alice\",\"password\":\"pw\"}\n";
    const GET_USERS: &[u8] = b"{\"command\":\"get_users\"}\n";

    #[test]
    fn keeps_partial_tail() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(GET_USERS);
        buf.extend_from_slice(&LOGIN[..10]);

        let frames = extract_frames(&mut buf);
        assert_eq!(frames, vec![Envelope::GetUsers]);
        assert_eq!(&buf[..], &LOGIN[..10]);

        buf.extend_from_slice(&LOGIN[10..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Envelope::Login(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time() {
        let mut decoder = FrameDecoder::default();
        let mut out = Vec::new();
        for b in LOGIN.iter().chain(GET_USERS) {
            out.extend(decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Envelope::GetUsers);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut decoder = FrameDecoder::default();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(b"not json at all\n");
        chunk.extend_from_slice(b"{\"command\":\"shout\"}\n");
        chunk.extend_from_slice(b"\r\n\n");
        chunk.extend_from_slice(b"{\"command\":\"get_users\"}\r\n");

        assert_eq!(decoder.feed(&chunk), vec![Envelope::GetUsers]);
    }

    #[test]
    fn oversized_frame_is_discarded_and_stream_recovers() {
        let mut decoder = FrameDecoder::new(32);

        assert!(decoder.feed(&[b'x'; 40]).is_empty());
        assert_eq!(decoder.buffered(), 0);

        // Rest of the oversized frame, then a good one.
        let mut chunk = b"yyyy\n".to_vec();
        chunk.extend_from_slice(GET_USERS);
        assert_eq!(decoder.feed(&chunk), vec![Envelope::GetUsers]);
    }

    #[test]
    fn oversized_complete_frame_in_one_read_is_dropped() {
        let mut decoder = FrameDecoder::new(30);
        let mut chunk = LOGIN.to_vec();
        chunk.extend_from_slice(GET_USERS);
        assert_eq!(decoder.feed(&chunk), vec![Envelope::GetUsers]);
    }
}

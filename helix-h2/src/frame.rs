//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! HTTP/2 frames have a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```

use crate::error::{ErrorCode, H2Error};

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame type constants (RFC 7540 Section 6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flag constants.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// An HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// DATA frame (type 0x0): request or response body.
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
    },
    /// HEADERS frame (type 0x1): HPACK-encoded header block fragment.
    Headers {
        stream_id: u32,
        encoded: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    /// PRIORITY frame (type 0x2): advisory, ignored by the server.
    Priority { stream_id: u32, priority: Priority },
    /// RST_STREAM frame (type 0x3): abnormal stream termination.
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// SETTINGS frame (type 0x4): raw (identifier, value) pairs.
    Settings { ack: bool, params: Vec<(u16, u32)> },
    /// PUSH_PROMISE frame (type 0x5): never legal from a client.
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        encoded: Vec<u8>,
        end_headers: bool,
    },
    /// PING frame (type 0x6): connection liveness check.
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// GOAWAY frame (type 0x7): graceful shutdown.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// WINDOW_UPDATE frame (type 0x8): flow control window increment.
    WindowUpdate { stream_id: u32, increment: u32 },
    /// CONTINUATION frame (type 0x9): header block continuation.
    Continuation {
        stream_id: u32,
        encoded: Vec<u8>,
        end_headers: bool,
    },
    /// Unknown frame type, ignored on receipt.
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Vec<u8>,
    },
}

/// Stream priority information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn decode(buf: &[u8]) -> Self {
        let raw = get_u32(buf);
        Priority {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & STREAM_ID_MASK,
            weight: buf[4],
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let mut dep = self.dependency & STREAM_ID_MASK;
        if self.exclusive {
            dep |= 0x8000_0000;
        }
        put_u32(buf, dep);
        buf.push(self.weight);
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Read a big-endian u32 from the first four bytes of `buf`.
fn get_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

// -- Frame header encoding/decoding --

/// Encode a 9-byte frame header.
pub fn encode_frame_header(
    buf: &mut Vec<u8>,
    payload_len: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
) {
    let len = payload_len as u32;
    buf.extend_from_slice(&len.to_be_bytes()[1..]);
    buf.push(frame_type);
    buf.push(flags);
    put_u32(buf, stream_id & STREAM_ID_MASK);
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

/// Decode a 9-byte frame header from the start of `buf`.
/// Returns `None` if the buffer is too short.
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
        frame_type: buf[3],
        flags: buf[4],
        stream_id: get_u32(&buf[5..]) & STREAM_ID_MASK,
    })
}

// -- Frame encoding --

impl Frame {
    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                encode_frame_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                encoded,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                let mut len = encoded.len();
                if priority.is_some() {
                    flags |= FLAG_PRIORITY;
                    len += 5;
                }
                encode_frame_header(buf, len, FRAME_HEADERS, flags, *stream_id);
                if let Some(pri) = priority {
                    pri.encode(buf);
                }
                buf.extend_from_slice(encoded);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                encode_frame_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
                priority.encode(buf);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                encode_frame_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                put_u32(buf, *error_code as u32);
            }
            Frame::Settings { ack, params } => {
                if *ack {
                    encode_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
                } else {
                    encode_frame_header(buf, params.len() * 6, FRAME_SETTINGS, 0, 0);
                    for &(id, value) in params {
                        buf.extend_from_slice(&id.to_be_bytes());
                        put_u32(buf, value);
                    }
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                encoded,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, 4 + encoded.len(), FRAME_PUSH_PROMISE, flags, *stream_id);
                put_u32(buf, *promised_stream_id & STREAM_ID_MASK);
                buf.extend_from_slice(encoded);
            }
            Frame::Ping { ack, opaque_data } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_frame_header(buf, 8, FRAME_PING, flags, 0);
                buf.extend_from_slice(opaque_data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                encode_frame_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                put_u32(buf, *last_stream_id & STREAM_ID_MASK);
                put_u32(buf, *error_code as u32);
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                put_u32(buf, *increment & STREAM_ID_MASK);
            }
            Frame::Continuation {
                stream_id,
                encoded,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, encoded.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(encoded);
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                encode_frame_header(buf, payload.len(), *frame_type, *flags, *stream_id);
                buf.extend_from_slice(payload);
            }
        }
    }
}

// -- Frame decoding --

/// Decode one frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success,
/// `Ok(None)` if the buffer is incomplete (need more data),
/// or `Err` on protocol error.
pub fn decode_frame(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, H2Error> {
    let Some(header) = decode_frame_header(buf) else {
        return Ok(None);
    };

    // Checked before waiting for the payload so an oversized length cannot
    // make the caller buffer up to 16 MiB.
    if header.length > max_frame_size {
        return Err(H2Error::FrameSizeError);
    }

    let total_len = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_LEN..total_len];
    let flags = header.flags;
    let stream_id = header.stream_id;

    let require_stream = |name: &str| {
        if stream_id == 0 {
            Err(H2Error::ProtocolError(format!("{name} on stream 0")))
        } else {
            Ok(())
        }
    };
    let require_connection = |name: &str| {
        if stream_id != 0 {
            Err(H2Error::ProtocolError(format!("{name} on non-zero stream")))
        } else {
            Ok(())
        }
    };

    let frame = match header.frame_type {
        FRAME_DATA => {
            require_stream("DATA")?;
            let data = strip_padding(payload, flags)?;
            Frame::Data {
                stream_id,
                payload: data.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_HEADERS => {
            require_stream("HEADERS")?;
            let data = strip_padding(payload, flags)?;
            let (priority, block) = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(H2Error::FrameSizeError);
                }
                (Some(Priority::decode(data)), &data[5..])
            } else {
                (None, data)
            };
            Frame::Headers {
                stream_id,
                encoded: block.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            require_stream("PRIORITY")?;
            if payload.len() != 5 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::Priority {
                stream_id,
                priority: Priority::decode(payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream("RST_STREAM")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(get_u32(payload)),
            }
        }
        FRAME_SETTINGS => {
            require_connection("SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::FrameSizeError);
            }
            if !payload.len().is_multiple_of(6) {
                return Err(H2Error::FrameSizeError);
            }
            let params = payload
                .chunks_exact(6)
                .map(|p| (u16::from_be_bytes([p[0], p[1]]), get_u32(&p[2..])))
                .collect();
            Frame::Settings { ack, params }
        }
        FRAME_PUSH_PROMISE => {
            require_stream("PUSH_PROMISE")?;
            let data = strip_padding(payload, flags)?;
            if data.len() < 4 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: get_u32(data) & STREAM_ID_MASK,
                encoded: data[4..].to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING => {
            require_connection("PING")?;
            let opaque_data: [u8; 8] = payload.try_into().map_err(|_| H2Error::FrameSizeError)?;
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection("GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::GoAway {
                last_stream_id: get_u32(payload) & STREAM_ID_MASK,
                error_code: ErrorCode::from_u32(get_u32(&payload[4..])),
                debug_data: payload[8..].to_vec(),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            let increment = get_u32(payload) & STREAM_ID_MASK;
            if increment == 0 {
                return Err(H2Error::ProtocolError("WINDOW_UPDATE with 0 increment".into()));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FRAME_CONTINUATION => {
            require_stream("CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                encoded: payload.to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        _ => Frame::Unknown {
            frame_type: header.frame_type,
            flags,
            stream_id,
            payload: payload.to_vec(),
        },
    };

    Ok(Some((frame, total_len)))
}

/// Strip padding from a frame payload if the PADDED flag is set.
fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload.split_first().ok_or(H2Error::FrameSizeError)?;
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(H2Error::ProtocolError("padding exceeds payload".into()));
    }
    Ok(&rest[..rest.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(buf: &[u8]) -> Frame {
        let (frame, consumed) = decode_frame(buf, 16384).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        frame
    }

    #[test]
    fn frame_header_layout() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 0x01_0203, FRAME_DATA, FLAG_END_STREAM, 0x8000_0005);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05]);
        let header = decode_frame_header(&buf).unwrap();
        assert_eq!(header.length, 0x01_0203);
        // Reserved bit cleared.
        assert_eq!(header.stream_id, 5);
    }

    #[test]
    fn headers_with_priority_decodes_block_after_priority() {
        let frame = Frame::Headers {
            stream_id: 1,
            encoded: vec![0x82, 0x84],
            end_stream: true,
            end_headers: true,
            priority: Some(Priority {
                exclusive: true,
                dependency: 3,
                weight: 200,
            }),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(decode_one(&buf), frame);
    }

    #[test]
    fn padded_data_is_stripped() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 1 + 3 + 2, FRAME_DATA, FLAG_PADDED, 1);
        buf.push(2);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[0, 0]);
        match decode_one(&buf) {
            Frame::Data { payload, .. } => assert_eq!(payload, b"abc"),
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn padding_longer_than_payload_rejected() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 2, FRAME_DATA, FLAG_PADDED, 1);
        buf.extend_from_slice(&[5, b'x']);
        assert!(matches!(
            decode_frame(&buf, 16384),
            Err(H2Error::ProtocolError(_))
        ));
    }

    #[test]
    fn settings_params_preserved_in_order() {
        let frame = Frame::Settings {
            ack: false,
            params: vec![(0x4, 1 << 20), (0x3, 10), (0xfe, 1)],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 18);
        assert_eq!(decode_one(&buf), frame);
    }

    #[test]
    fn settings_ack_with_payload_rejected() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 6, FRAME_SETTINGS, FLAG_ACK, 0);
        buf.extend_from_slice(&[0; 6]);
        assert_eq!(decode_frame(&buf, 16384), Err(H2Error::FrameSizeError));
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 5, FRAME_DATA, 0, 1);
        buf.extend_from_slice(b"he");
        assert!(decode_frame(&buf, 16384).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected_before_payload_arrives() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 20000, FRAME_DATA, 0, 1);
        assert_eq!(decode_frame(&buf, 16384), Err(H2Error::FrameSizeError));
    }

    #[test]
    fn unknown_frame_type_accepted() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 3, 0xfe, 0x42, 7);
        buf.extend_from_slice(b"abc");
        assert_eq!(
            decode_one(&buf),
            Frame::Unknown {
                frame_type: 0xfe,
                flags: 0x42,
                stream_id: 7,
                payload: b"abc".to_vec(),
            }
        );
    }

    #[test]
    fn stream_scoped_frames_on_stream_zero_rejected() {
        for frame_type in [FRAME_DATA, FRAME_HEADERS, FRAME_CONTINUATION] {
            let mut buf = Vec::new();
            encode_frame_header(&mut buf, 0, frame_type, 0, 0);
            assert!(matches!(
                decode_frame(&buf, 16384),
                Err(H2Error::ProtocolError(_))
            ));
        }
    }

    #[test]
    fn ping_on_stream_rejected() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 8, FRAME_PING, 0, 1);
        buf.extend_from_slice(&[0; 8]);
        assert!(decode_frame(&buf, 16384).is_err());
    }

    #[test]
    fn window_update_zero_increment_rejected() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 4, FRAME_WINDOW_UPDATE, 0, 1);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            decode_frame(&buf, 16384),
            Err(H2Error::ProtocolError(_))
        ));
    }

    #[test]
    fn goaway_carries_debug_data() {
        let frame = Frame::GoAway {
            last_stream_id: 5,
            error_code: ErrorCode::EnhanceYourCalm,
            debug_data: b"slow down".to_vec(),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(decode_one(&buf), frame);
    }
}

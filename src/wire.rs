use crate::seq::Seq;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

/// One-byte packet type tag, the first byte of every datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Sess = 0,
    Rel = 1,
    Ack = 2,
    Beat = 3,
    MapData = 5,
    ObjData = 6,
    ObjAck = 7,
    Close = 8,
}

/// An entire datagram payload: a one-byte type tag plus opaque payload bytes.
///
/// The type is kept as a raw byte so that packets with unknown tags can be
///  represented (and then ignored) rather than failing the receive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PMessage {
    pub mtype: u8,
    pub payload: Bytes,
}

impl PMessage {
    /// Upper bound for an encoded datagram, type tag included.
    pub const MAX_DATAGRAM: usize = 65536;

    pub fn new(mtype: MsgType, payload: Bytes) -> PMessage {
        PMessage {
            mtype: mtype.into(),
            payload,
        }
    }

    /// Parses a received datagram. An empty read yields no packet.
    pub fn decode(datagram: &[u8]) -> Option<PMessage> {
        let (&mtype, rest) = datagram.split_first()?;
        Some(PMessage {
            mtype,
            payload: Bytes::copy_from_slice(rest),
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mtype);
        buf.put_slice(&self.payload);
    }
}

/// A single message in one of the two reliable streams.
///
/// `mtype` is the 7-bit sub-type; the high bit is wire framing
///  ([`LENGTH_PREFIXED`]) and never part of the sub-type itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RMessage {
    pub seq: Seq,
    pub mtype: u8,
    pub payload: Bytes,
}

/// Bit 7 of a REL sub-type byte: a 16-bit length prefix follows, and further
///  sub-messages may come after the payload. Without it the payload extends to
///  the end of the packet.
pub const LENGTH_PREFIXED: u8 = 0x80;

/// Parses the body of a REL packet (everything after the 16-bit base seq) into
///  its sub-messages, assigning consecutive sequence numbers starting at `base`.
///
/// A truncated sub-message ends the parse early; whatever was parsed before it
///  is still returned, the rest of the buffer is discarded.
pub fn parse_rel_body(base: Seq, mut buf: Bytes) -> Vec<RMessage> {
    let mut seq = base;
    let mut out = Vec::new();
    while buf.has_remaining() {
        let head = buf.get_u8();
        let payload = if head & LENGTH_PREFIXED != 0 {
            if buf.remaining() < 2 {
                warn!("truncated length prefix in REL sub-message - discarding rest of packet");
                break;
            }
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                warn!(
                    "truncated REL sub-message: length {} with {} bytes left - discarding rest of packet",
                    len,
                    buf.remaining()
                );
                break;
            }
            buf.split_to(len)
        } else {
            buf.split_to(buf.remaining())
        };
        out.push(RMessage {
            seq,
            mtype: head & !LENGTH_PREFIXED,
            payload,
        });
        seq = seq.next();
    }
    out
}

/// Encodes one reliable message as a complete REL packet in the unprefixed
///  form: 16-bit seq, sub-type byte with the length bit clear, payload to the
///  end of the packet. This is the only form the sender emits - one message
///  per REL packet.
pub fn encode_rel_single(msg: &RMessage) -> PMessage {
    let mut buf = BytesMut::with_capacity(3 + msg.payload.len());
    buf.put_u16_le(msg.seq.to_raw());
    buf.put_u8(msg.mtype & !LENGTH_PREFIXED);
    buf.put_slice(&msg.payload);
    PMessage::new(MsgType::Rel, buf.freeze())
}

pub fn put_zstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn try_get_zstring(buf: &mut impl Buf) -> anyhow::Result<String> {
    let mut raw = Vec::new();
    loop {
        if !buf.has_remaining() {
            bail!("unterminated string");
        }
        match buf.get_u8() {
            0 => break,
            b => raw.push(b),
        }
    }
    Ok(String::from_utf8(raw)?)
}

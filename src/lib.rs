//! Client side of the Hafen game session protocol: a reliable-messaging layer
//!  on top of plain UDP datagrams.
//!
//! ## Design goals
//!
//! * One session per server, bound to a single remote endpoint over a
//!   connected UDP socket
//! * Two ordered streams of short control messages (outbound and inbound),
//!   delivered reliably and exactly once on top of the unreliable transport
//!   * messages carry 16-bit wrapping sequence numbers; ordering comparisons
//!     use the signed difference, so the usable window is 2^15
//!   * unacknowledged messages are re-sent in widening backoff tiers
//!   * inbound acks are delayed briefly so a burst of deliveries collapses
//!     into a single ACK packet
//! * Bulk data (map tiles, object-state deltas) stays unreliable and is
//!   forwarded to the application's caches; object-state records are
//!   acknowledged per object with batched frame-number acks
//! * A four-stage lifecycle: authenticated connect, the main exchange, an
//!   orderly close handshake, terminated
//! * One worker task owns the socket and all reliability state; application
//!   threads only enqueue messages and wake the worker
//!
//! ## Wire format
//!
//! Every datagram is a one-byte type tag followed by the payload. All
//!  integers are little-endian; strings are null-terminated UTF-8.
//!
//! ```ascii
//! SESS (0)    out: u16 2, "Hafen", u16 protocol version, username,
//!               u16 cookie length, cookie, encoded argument list
//!             in:  u8 error code (0 = accepted), optional message string
//! REL  (1)    u16 base seq, then one or more sub-messages:
//!               u8 sub-type; bit 7 set: u16 payload length, payload
//!                            bit 7 clear: payload to end of packet (last)
//! ACK  (2)    u16 seq - acknowledges everything up to and including it
//! BEAT (3)    empty; sent after 5s of outbound silence
//! MAPDATA (5) opaque map-tile payload, forwarded to the map cache
//! OBJDATA (6) records of u8 flags, u32 id, i32 frame, body (consumed by
//!               the object cache)
//! OBJACK (7)  pairs of u32 id, i32 frame
//! CLOSE (8)   empty; either side initiates, both sides echo
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod seq;
pub mod wire;
mod objack;
mod pending;
mod receive;
mod send_pipeline;

pub use config::SessionConfig;
pub use connection::Connection;
pub use dispatch::{MapCache, MessageHandler, ObjectCache, SessionHandlers};
pub use error::SessionError;
pub use seq::Seq;
pub use wire::{MsgType, PMessage, RMessage};

use anyhow::bail;
use std::time::Duration;

/// Protocol version the client reports in its connect request. The server
///  rejects mismatches with a PVER error, so this moves in lock-step with the
///  server deployment.
pub const PVER: u16 = 17;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reported as the client protocol version in the connect request.
    pub protocol_version: u16,

    /// How long a pending inbound ack is held back so that a burst of
    ///  contiguous deliveries collapses into a single ACK packet.
    pub ack_hold: Duration,

    /// A BEAT is emitted whenever nothing has been transmitted for this long,
    ///  keeping NAT mappings and the server-side liveness check alive.
    pub beat_interval: Duration,

    pub connect_retry_interval: Duration,
    pub connect_attempts: u32,

    pub close_retry_interval: Duration,
    pub close_attempts: u32,

    /// Size threshold for batching object acks into OBJACK packets. A packet
    ///  is flushed and a new one started once it grows past this budget minus
    ///  one entry.
    pub objack_packet_budget: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            protocol_version: PVER,
            ack_hold: Duration::from_millis(30),
            beat_interval: Duration::from_secs(5),
            connect_retry_interval: Duration::from_secs(2),
            connect_attempts: 5,
            close_retry_interval: Duration::from_millis(500),
            close_attempts: 5,
            objack_packet_budget: 1000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_attempts == 0 {
            bail!("connect_attempts must be at least 1");
        }
        if self.close_attempts == 0 {
            bail!("close_attempts must be at least 1");
        }
        if self.ack_hold >= self.beat_interval {
            bail!("ack_hold must be shorter than beat_interval");
        }
        if self.objack_packet_budget < 16 {
            bail!("objack_packet_budget is too small to fit a single entry");
        }
        Ok(())
    }
}

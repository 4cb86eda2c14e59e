use crate::wire::PMessage;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Abstraction for sending a datagram on the connected socket, introduced to
///  facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn do_send_packet(&self, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet {:?}", packet_buf);

        // Send errors are treated as packet loss: the reliability layer
        //  retransmits anything that matters.
        if let Err(e) = self.send(packet_buf).await {
            warn!("error sending UDP packet: {} - treating as packet loss", e);
        }
    }
}

/// Owns the encode-and-transmit path for outbound packets.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn send_pmsg(&self, msg: &PMessage) {
        let mut buf = BytesMut::with_capacity(1 + msg.payload.len());
        msg.encode_into(&mut buf);
        self.socket.do_send_packet(&buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MsgType;

    #[tokio::test]
    async fn test_send_pmsg_prepends_type_tag() {
        let mut socket = MockSendSocket::new();
        socket
            .expect_do_send_packet()
            .withf(|buf| buf == [u8::from(MsgType::Ack), 7, 0])
            .once()
            .return_const(());

        let pipeline = SendPipeline::new(Arc::new(socket));
        pipeline
            .send_pmsg(&PMessage::new(MsgType::Ack, vec![7, 0].into()))
            .await;
    }
}

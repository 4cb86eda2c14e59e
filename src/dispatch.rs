use crate::wire::RMessage;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// The application's consumer of the inbound reliable stream. Each message is
///  handed over exactly once, in sequence order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: RMessage);
}

/// Consumer of the unreliable map-tile stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MapCache: Send + Sync + 'static {
    async fn mapdata(&self, data: Bytes);
}

/// Consumer of the unreliable object-state stream.
///
/// `receive` gets the shared packet buffer positioned at its record body and
///  must consume exactly that body, since the next record starts wherever the
///  implementation leaves the buffer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectCache: Send + Sync + 'static {
    async fn receive(&self, flags: u8, id: u32, frame: i32, data: &mut Bytes);
}

struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn handle(&self, _msg: RMessage) {}
}

#[async_trait]
impl MapCache for NoopHandler {
    async fn mapdata(&self, _data: Bytes) {}
}

#[async_trait]
impl ObjectCache for NoopHandler {
    async fn receive(&self, _flags: u8, _id: u32, _frame: i32, data: &mut Bytes) {
        // without a real cache the record body cannot be sized, so the rest
        //  of the packet is consumed
        data.advance(data.remaining());
    }
}

/// The bundle of application collaborators a session dispatches into. The
///  default discards everything, which is enough to keep a session alive.
#[derive(Clone)]
pub struct SessionHandlers {
    pub rel: Arc<dyn MessageHandler>,
    pub map: Arc<dyn MapCache>,
    pub objects: Arc<dyn ObjectCache>,
}

impl Default for SessionHandlers {
    fn default() -> SessionHandlers {
        SessionHandlers {
            rel: Arc::new(NoopHandler),
            map: Arc::new(NoopHandler),
            objects: Arc::new(NoopHandler),
        }
    }
}

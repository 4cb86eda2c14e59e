use crate::config::SessionConfig;
use crate::dispatch::SessionHandlers;
use crate::error::SessionError;
use crate::objack::ObjAckTracker;
use crate::pending::PendingQueue;
use crate::receive::ReceiveQueue;
use crate::send_pipeline::SendPipeline;
use crate::seq::Seq;
use crate::wire::{self, MsgType, PMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// State shared between the session worker and application threads.
struct ConnShared {
    config: SessionConfig,
    pending: Mutex<PendingQueue>,
    wake: Notify,
    intr: AtomicBool,
}

/// A session with one game server, bound to a single remote UDP endpoint.
///
/// The session is driven by a dedicated worker task that owns the socket and
///  all reliability state; application code interacts with it through
///  [`Connection::connect`], [`Connection::queuemsg`] and
///  [`Connection::close`], all of which are safe to call from any thread.
pub struct Connection {
    server: SocketAddr,
    username: String,
    shared: Arc<ConnShared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("username", &self.username)
            .finish()
    }
}

impl Connection {
    /// Establishes an authenticated session with `server`.
    ///
    /// The connect request carries `username`, the authentication `cookie`
    ///  obtained out of band, and a pre-encoded argument list `args` that is
    ///  appended verbatim. Completion is driven by the worker: this call
    ///  resolves once the server has accepted or rejected the session, or
    ///  after the retry budget is exhausted.
    pub async fn connect(
        server: SocketAddr,
        username: &str,
        cookie: &[u8],
        args: &[u8],
        handlers: SessionHandlers,
        config: SessionConfig,
    ) -> Result<Connection, SessionError> {
        if let Err(e) = config.validate() {
            error!("invalid session config: {:#}", e);
            return Err(SessionError::Conn);
        }

        let socket = match Self::bind_socket(server).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("could not set up session socket for {:?}: {}", server, e);
                return Err(SessionError::Conn);
            }
        };
        info!("connecting to {:?} as {:?}", server, username);

        let connect_msg = build_connect_msg(&config, username, cookie, args);
        let shared = Arc::new(ConnShared {
            config,
            pending: Mutex::new(PendingQueue::new()),
            wake: Notify::new(),
            intr: AtomicBool::new(false),
        });

        let (result_in, result_out) = oneshot::channel();
        let ctx = WorkerCtx {
            shared: shared.clone(),
            handlers,
            pipeline: SendPipeline::new(socket.clone()),
            socket,
            recv_buf: vec![0u8; PMessage::MAX_DATAGRAM],
        };
        tokio::spawn(run_worker(
            ctx,
            ConnectPhase {
                msg: connect_msg,
                result: Some(result_in),
            },
        ));

        match result_out.await {
            Ok(Ok(())) => Ok(Connection {
                server,
                username: username.to_string(),
                shared,
            }),
            Ok(Err(e)) => Err(e),
            // the worker died without reporting a result
            Err(_) => Err(SessionError::Conn),
        }
    }

    async fn bind_socket(server: SocketAddr) -> io::Result<UdpSocket> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
        } else {
            (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        Ok(socket)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Enqueues an outbound reliable message. Non-blocking; the worker is
    ///  woken to transmit it. Messages go out strictly in enqueue order.
    pub fn queuemsg(&self, mtype: u8, payload: impl Into<Bytes>) {
        self.shared
            .pending
            .lock()
            .expect("pending queue lock poisoned")
            .enqueue(mtype, payload.into());
        self.shared.wake.notify_one();
    }

    /// Requests an orderly shutdown. Asynchronous and idempotent: the worker
    ///  runs the close handshake and releases the socket on its own.
    pub fn close(&self) {
        self.shared.intr.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

/// Everything the worker task owns. The socket lives and dies with this
///  struct, so it is closed exactly once, when the phase loop ends.
struct WorkerCtx {
    shared: Arc<ConnShared>,
    handlers: SessionHandlers,
    pipeline: SendPipeline,
    socket: Arc<UdpSocket>,
    recv_buf: Vec<u8>,
}

impl WorkerCtx {
    fn interrupted(&self) -> bool {
        self.shared.intr.load(Ordering::SeqCst)
    }

    /// Picks up the next readable datagram without blocking. `None` means the
    ///  burst is drained (or an empty datagram arrived, which carries no
    ///  packet either way).
    fn try_recv_pmsg(&mut self) -> io::Result<Option<PMessage>> {
        match self.socket.try_recv(&mut self.recv_buf) {
            Ok(n) => Ok(PMessage::decode(&self.recv_buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

enum Phase {
    Main(MainPhase),
    Close(ClosePhase),
}

async fn run_worker(mut ctx: WorkerCtx, init: ConnectPhase) {
    let mut phase = match init.run(&mut ctx).await {
        Some(next) => next,
        None => return,
    };
    loop {
        let next = match phase {
            Phase::Main(p) => p.run(&mut ctx).await,
            Phase::Close(p) => p.run(&mut ctx).await,
        };
        match next {
            Some(p) => phase = p,
            None => break,
        }
    }
    info!("session worker terminated");
    // dropping ctx closes the socket
}

fn build_connect_msg(config: &SessionConfig, username: &str, cookie: &[u8], args: &[u8]) -> PMessage {
    let mut buf = BytesMut::new();
    // connect-message format version
    buf.put_u16_le(2);
    wire::put_zstring(&mut buf, "Hafen");
    buf.put_u16_le(config.protocol_version);
    wire::put_zstring(&mut buf, username);
    let cookie_len = u16::try_from(cookie.len()).expect("authentication cookie does not fit a u16 length");
    buf.put_u16_le(cookie_len);
    buf.put_slice(cookie);
    // the argument list is pre-encoded by the caller and appended verbatim
    buf.put_slice(args);
    PMessage::new(MsgType::Sess, buf.freeze())
}

fn parse_sess_reply(mut payload: Bytes) -> Option<Result<(), SessionError>> {
    if !payload.has_remaining() {
        warn!("empty SESS reply - ignoring");
        return None;
    }
    let code = payload.get_u8();
    if code == 0 {
        Some(Ok(()))
    } else {
        let message = wire::try_get_zstring(&mut payload).ok();
        Some(Err(SessionError::from_code(code, message)))
    }
}

struct ConnectPhase {
    msg: PMessage,
    result: Option<oneshot::Sender<Result<(), SessionError>>>,
}

impl ConnectPhase {
    async fn run(mut self, ctx: &mut WorkerCtx) -> Option<Phase> {
        let outcome = self.negotiate(ctx).await;
        let next = match &outcome {
            Ok(()) => {
                info!("session established");
                Some(Phase::Main(MainPhase::new(Instant::now())))
            }
            Err(e) => {
                debug!("connect failed: {}", e);
                None
            }
        };
        if let Some(result) = self.result.take() {
            let _ = result.send(outcome);
        }
        next
    }

    async fn negotiate(&mut self, ctx: &mut WorkerCtx) -> Result<(), SessionError> {
        let retry = ctx.shared.config.connect_retry_interval;
        let mut tries = 0u32;
        let mut last: Option<Instant> = None;
        loop {
            if ctx.interrupted() {
                return Err(SessionError::Conn);
            }
            let now = Instant::now();
            if last.map_or(true, |l| now - l >= retry) {
                tries += 1;
                if tries > ctx.shared.config.connect_attempts {
                    return Err(SessionError::Conn);
                }
                debug!("sending connect request, attempt {}", tries);
                ctx.pipeline.send_pmsg(&self.msg).await;
                last = Some(now);
            }
            let deadline = match last {
                Some(l) => l + retry,
                None => now,
            };

            let socket = ctx.socket.clone();
            let shared = ctx.shared.clone();
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = time::sleep_until(deadline) => {}
                r = socket.readable() => {
                    if let Err(e) = r {
                        error!("socket error while connecting: {}", e);
                        return Err(SessionError::Conn);
                    }
                    loop {
                        match ctx.try_recv_pmsg() {
                            Ok(Some(msg)) if msg.mtype == u8::from(MsgType::Sess) => {
                                if let Some(result) = parse_sess_reply(msg.payload) {
                                    return result;
                                }
                            }
                            // only SESS means anything before the session is up
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                error!("read error while connecting: {}", e);
                                return Err(SessionError::Conn);
                            }
                        }
                    }
                }
            }
        }
    }
}

struct MainPhase {
    recvq: ReceiveQueue,
    objacks: ObjAckTracker,
    /// timestamp of the current iteration, refreshed once per tick after the
    ///  receive drain; packet handlers deliberately see the pre-wait stamp
    now: Instant,
    lasttx: Instant,
}

impl MainPhase {
    fn new(now: Instant) -> MainPhase {
        MainPhase {
            recvq: ReceiveQueue::new(),
            objacks: ObjAckTracker::new(),
            now,
            lasttx: now,
        }
    }

    async fn run(mut self, ctx: &mut WorkerCtx) -> Option<Phase> {
        let ack_hold = ctx.shared.config.ack_hold;
        let beat_interval = ctx.shared.config.beat_interval;
        let mut pendto = Some(self.now);
        loop {
            let mut deadline = self.lasttx + beat_interval;
            if let Some(ack) = self.recvq.next_ack_deadline(ack_hold) {
                deadline = deadline.min(ack);
            }
            if let Some(p) = pendto {
                deadline = deadline.min(p);
            }

            let socket = ctx.socket.clone();
            let shared = ctx.shared.clone();
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = time::sleep_until(deadline) => {}
                r = socket.readable() => {
                    if let Err(e) = r {
                        error!("socket error: {}", e);
                        return None;
                    }
                    loop {
                        match ctx.try_recv_pmsg() {
                            Ok(Some(msg)) => {
                                if let Some(next) = self.handle_pmsg(ctx, msg).await {
                                    return Some(next);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!("read error: {}", e);
                                return None;
                            }
                        }
                    }
                }
            }
            if ctx.interrupted() {
                debug!("interrupted - starting close handshake");
                return Some(Phase::Close(ClosePhase { sawclose: false }));
            }
            self.now = Instant::now();

            pendto = earliest(self.send_pending(ctx).await, self.send_objacks(ctx).await);

            if let Some(seq) = self.recvq.take_due_ack(self.now, ack_hold) {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u16_le(seq.to_raw());
                ctx.pipeline.send_pmsg(&PMessage::new(MsgType::Ack, buf.freeze())).await;
                self.lasttx = self.now;
            }

            if self.now - self.lasttx >= beat_interval {
                ctx.pipeline.send_pmsg(&PMessage::new(MsgType::Beat, Bytes::new())).await;
                self.lasttx = self.now;
            }
        }
    }

    async fn handle_pmsg(&mut self, ctx: &mut WorkerCtx, msg: PMessage) -> Option<Phase> {
        match MsgType::try_from(msg.mtype) {
            Ok(MsgType::Close) => {
                debug!("received CLOSE - starting close handshake");
                return Some(Phase::Close(ClosePhase { sawclose: true }));
            }
            // the session is already established
            Ok(MsgType::Sess) => {}
            Ok(MsgType::Rel) => self.handle_rel(ctx, msg.payload).await,
            Ok(MsgType::Ack) => self.handle_ack(ctx, msg.payload),
            Ok(MsgType::MapData) => ctx.handlers.map.mapdata(msg.payload).await,
            Ok(MsgType::ObjData) => self.handle_objdata(ctx, msg.payload).await,
            Ok(MsgType::Beat) | Ok(MsgType::ObjAck) => {}
            Err(_) => debug!("unknown packet type {} - ignoring", msg.mtype),
        }
        None
    }

    async fn handle_rel(&mut self, ctx: &mut WorkerCtx, mut payload: Bytes) {
        if payload.remaining() < 2 {
            warn!("REL packet without base seq - ignoring");
            return;
        }
        let base = Seq::from_raw(payload.get_u16_le());
        for rmsg in wire::parse_rel_body(base, payload) {
            for delivery in self.recvq.on_rel(rmsg, self.now) {
                ctx.handlers.rel.handle(delivery).await;
            }
        }
    }

    fn handle_ack(&mut self, ctx: &WorkerCtx, mut payload: Bytes) {
        if payload.remaining() < 2 {
            warn!("ACK packet without seq - ignoring");
            return;
        }
        let seq = Seq::from_raw(payload.get_u16_le());
        ctx.shared
            .pending
            .lock()
            .expect("pending queue lock poisoned")
            .on_ack(seq);
    }

    async fn handle_objdata(&mut self, ctx: &mut WorkerCtx, mut payload: Bytes) {
        while payload.has_remaining() {
            if payload.remaining() < 9 {
                warn!("truncated OBJDATA record - discarding rest of packet");
                break;
            }
            let flags = payload.get_u8();
            let id = payload.get_u32_le();
            let frame = payload.get_i32_le();
            ctx.handlers.objects.receive(flags, id, frame, &mut payload).await;
            self.objacks.observe(id, frame, self.now);
        }
    }

    async fn send_pending(&mut self, ctx: &mut WorkerCtx) -> Option<Instant> {
        let (due, mint) = ctx
            .shared
            .pending
            .lock()
            .expect("pending queue lock poisoned")
            .collect_due(self.now);
        for msg in due {
            ctx.pipeline.send_pmsg(&wire::encode_rel_single(&msg)).await;
            self.lasttx = self.now;
        }
        mint
    }

    async fn send_objacks(&mut self, ctx: &mut WorkerCtx) -> Option<Instant> {
        let (batches, mint) = self
            .objacks
            .collect_due(self.now, ctx.shared.config.objack_packet_budget);
        for batch in batches {
            let mut buf = BytesMut::with_capacity(batch.len() * 8);
            for (id, frame) in batch {
                buf.put_u32_le(id);
                buf.put_i32_le(frame);
            }
            ctx.pipeline.send_pmsg(&PMessage::new(MsgType::ObjAck, buf.freeze())).await;
            self.lasttx = self.now;
        }
        mint
    }
}

struct ClosePhase {
    sawclose: bool,
}

impl ClosePhase {
    /// Runs the teardown handshake. Interrupts are ignored here: once
    ///  closing, the handshake runs to completion or retry exhaustion.
    async fn run(mut self, ctx: &mut WorkerCtx) -> Option<Phase> {
        let retry = ctx.shared.config.close_retry_interval;
        let mut tries = 0u32;
        let mut last: Option<Instant> = None;
        loop {
            let now = Instant::now();
            if last.map_or(true, |l| now - l >= retry) {
                tries += 1;
                if tries > ctx.shared.config.close_attempts {
                    debug!("close handshake gave up after {} attempts", tries - 1);
                    return None;
                }
                ctx.pipeline.send_pmsg(&PMessage::new(MsgType::Close, Bytes::new())).await;
                last = Some(now);
            }
            let deadline = match last {
                Some(l) => l + retry,
                None => now,
            };

            let socket = ctx.socket.clone();
            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                r = socket.readable() => {
                    if let Err(e) = r {
                        error!("socket error during close: {}", e);
                        return None;
                    }
                    loop {
                        match ctx.try_recv_pmsg() {
                            Ok(Some(msg)) if msg.mtype == u8::from(MsgType::Close) => {
                                self.sawclose = true;
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                error!("read error during close: {}", e);
                                return None;
                            }
                        }
                    }
                }
            }
            if self.sawclose {
                debug!("close handshake complete");
                return None;
            }
        }
    }
}

/// Sentinel-aware minimum over optional deadlines.
fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

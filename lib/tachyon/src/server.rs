use crate::buffer::RingBuffer;
use crate::channel::Channel;
use crate::connection::{ctx, Connection, ConnectionId, MsgPoster};
use crate::datagram::Datagram;
use crate::dispatch::{Dispatcher, UserContext};
use crate::eventloop::{Completer, LoopThread, COMPLETION_BATCH};
use crate::fabric::{
    access, CmEvent, Completion, CompletionQueue, Domain, EventQueue, Fabric, MsgEndpoint,
};
use hashbrown::HashMap;
use indexmap::IndexSet;
use ion::logging;
use ion::options::Options;
use ion::reqid::Reqid;
use ion::shared::{ErrorCode, ErrorType, Payload, TransportError, TransportResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fired when an accepted connection reaches the connected state.
pub type NewConnectionCb = Box<dyn FnMut(ConnectionId) + Send>;

/// Fired after a connection closes, with the reason.
pub type ConnectionCloseCb = Box<dyn FnMut(ConnectionId, ErrorCode) + Send>;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(10);

struct ServerSession {
    ep: Arc<Mutex<Box<dyn MsgEndpoint>>>,
    eq: Box<dyn EventQueue>,
    txcq: Box<dyn CompletionQueue>,
    rxcq: Box<dyn CompletionQueue>,
    // owns the registered regions' domain for the session lifetime
    _domain: Box<dyn Domain>,
    conn: Arc<Connection>,
}

enum Mode {
    Msg {
        fabric: Mutex<Box<dyn Fabric>>,
        listener: Mutex<Option<Box<dyn EventQueue>>>,
        sessions: Mutex<HashMap<ConnectionId, ServerSession>>,
    },
    Rdm {
        datagram: Arc<Datagram>,
    },
}

/// Passive side: listens, accepts, and tracks connections from pending
/// (accepted, not yet confirmed) to active. User code addresses
/// connections by id through the send methods.
pub struct Server {
    opts: Options,
    mode: Mode,
    pending: Mutex<IndexSet<ConnectionId>>,
    active: Arc<Mutex<IndexSet<ConnectionId>>>,
    next_id: AtomicU64,
    dispatch: Arc<Dispatcher>,
    handle_new_connection: Arc<Mutex<Option<NewConnectionCb>>>,
    handle_connection_close: Arc<Mutex<Option<ConnectionCloseCb>>>,
    completer: Mutex<Option<Completer>>,
    worker: Mutex<Option<LoopThread>>,
    housekeeping: Mutex<Instant>,
    log: logging::Logger,
}

impl Server {
    /// Server over a passive connection-oriented endpoint.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        fabric: Box<dyn Fabric>,
        log: L,
    ) -> Server {
        let log = logging::child(log);
        Server {
            opts,
            mode: Mode::Msg {
                fabric: Mutex::new(fabric),
                listener: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
            },
            pending: Mutex::new(IndexSet::new()),
            active: Arc::new(Mutex::new(IndexSet::new())),
            next_id: AtomicU64::new(1),
            dispatch: Arc::new(Dispatcher::new(&log)),
            handle_new_connection: Arc::new(Mutex::new(None)),
            handle_connection_close: Arc::new(Mutex::new(None)),
            completer: Mutex::new(None),
            worker: Mutex::new(None),
            housekeeping: Mutex::new(Instant::now()),
            log,
        }
    }

    /// Server over a shared datagram multiplexer: peers appear as they
    /// complete the connect/confirm exchange.
    pub fn new_rdm<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        datagram: Arc<Datagram>,
        log: L,
    ) -> Arc<Server> {
        let log = logging::child(log);
        let server = Arc::new(Server {
            opts,
            mode: Mode::Rdm {
                datagram: datagram.clone(),
            },
            pending: Mutex::new(IndexSet::new()),
            active: Arc::new(Mutex::new(IndexSet::new())),
            next_id: AtomicU64::new(1),
            dispatch: Arc::new(Dispatcher::new(&log)),
            handle_new_connection: Arc::new(Mutex::new(None)),
            handle_connection_close: Arc::new(Mutex::new(None)),
            completer: Mutex::new(None),
            worker: Mutex::new(None),
            housekeeping: Mutex::new(Instant::now()),
            log,
        });

        // streams surface as connections keyed by their stream id
        let active = server.active.clone();
        let on_new = server.handle_new_connection.clone();
        datagram.set_on_connect(Box::new(move |stream| {
            active.lock().insert(u64::from(stream));
            if let Some(cb) = on_new.lock().as_mut() {
                cb(u64::from(stream));
            }
        }));

        let active = server.active.clone();
        let on_close = server.handle_connection_close.clone();
        datagram.set_on_close(Box::new(move |stream| {
            active.lock().swap_remove(&u64::from(stream));
            if let Some(cb) = on_close.lock().as_mut() {
                cb(u64::from(stream), ErrorCode::ReadError);
            }
        }));

        let dispatch = server.dispatch.clone();
        let sink_log = logging::child(&server.log);
        datagram.set_packet_sink(Box::new(move |stream, mut packet| {
            if let Err(err) = dispatch.route(u64::from(stream), &mut packet) {
                logging::error!(sink_log, "failed to route packet";
                                "context" => "sink",
                                "stream" => stream,
                                "error" => ?err);
            }
        }));

        let dispatch = server.dispatch.clone();
        let mut last_sweep = Instant::now();
        datagram.set_housekeeping(Box::new(move || {
            let now = Instant::now();
            if now.duration_since(last_sweep) < HOUSEKEEPING_INTERVAL {
                return false;
            }
            last_sweep = now;
            dispatch.sweep_timeouts(now) > 0
        }));

        server
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatch
    }

    pub fn set_handle_new_connection(&self, cb: NewConnectionCb) {
        *self.handle_new_connection.lock() = Some(cb);
    }

    pub fn set_handle_connection_close(&self, cb: ConnectionCloseCb) {
        *self.handle_connection_close.lock() = Some(cb);
    }

    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.active.lock().iter().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        match &self.mode {
            Mode::Msg { sessions, .. } => {
                sessions.lock().get(&id).map(|session| session.conn.clone())
            }
            Mode::Rdm { datagram } => datagram.channel(id as u16),
        }
    }

    /// Binds and starts listening (MSG), or registers a peer channel
    /// (RDM servers learn their peers through the connect protocol
    /// instead).
    pub fn start(&self) -> TransportResult<()> {
        match &self.mode {
            Mode::Msg {
                fabric, listener, ..
            } => {
                let eq = fabric.lock().listen(&self.opts)?;
                *listener.lock() = Some(eq);
                *self.completer.lock() = Some(Completer::new(self.opts.comp_method, &self.log)?);

                logging::info!(self.log, "listening";
                               "context" => "start",
                               "src" => %self.opts.src_endpoint());
            }
            Mode::Rdm { .. } => {
                logging::info!(self.log, "datagram server ready";
                               "context" => "start");
            }
        }
        Ok(())
    }

    /// Pre-registers an outgoing datagram channel towards a known peer, in
    /// addition to those created by inbound connects.
    pub fn add_channel(&self, stream: u16, raw_addr: &[u8]) -> TransportResult<()> {
        match &self.mode {
            Mode::Rdm { datagram } => {
                datagram.connect_peer(stream, raw_addr)?;
                self.active.lock().insert(u64::from(stream));
                Ok(())
            }
            Mode::Msg { .. } => Err(TransportError::Fatal(ErrorType::Resource)),
        }
    }

    /// Accepts one pending connect request into a new session.
    fn on_connect_request(&self, request: crate::fabric::ConnectRequest) -> TransportResult<()> {
        let (fabric, sessions) = match &self.mode {
            Mode::Msg {
                fabric, sessions, ..
            } => (fabric, sessions),
            Mode::Rdm { .. } => return Ok(()),
        };

        let mut session = fabric.lock().accept_msg(request)?;

        // Resource failures here reject the connection; no channel is
        // exposed to user code.
        let ring_bytes = self.opts.buf_size.min(session.max_msg_size);
        let rings = session
            .domain
            .register(ring_bytes, access::MSG)
            .and_then(|tx_region| {
                let rx_region = session.domain.register(ring_bytes, access::MSG)?;
                Ok((
                    RingBuffer::new(tx_region, self.opts.no_buffers)?,
                    RingBuffer::new(rx_region, self.opts.no_buffers)?,
                ))
            });
        let (tx, rx) = match rings {
            Ok(rings) => rings,
            Err(err) => {
                logging::error!(self.log, "failed to allocate connection resources, rejecting";
                                "context" => "accept",
                                "error" => ?err);
                drop(session.ep.reject());
                return Ok(());
            }
        };

        session.ep.enable()?;
        session.ep.accept()?;

        {
            let mut completer = self.completer.lock();
            if let Some(completer) = completer.as_mut() {
                completer.register(&*session.txcq)?;
                completer.register(&*session.rxcq)?;
            }
        }

        let ep = Arc::new(Mutex::new(session.ep));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::new(tx, rx, 0, 0, &self.log);
        let conn = Arc::new(Connection::new(
            id,
            channel,
            Box::new(MsgPoster::new(ep.clone())),
            self.opts.max_packet_size,
            self.opts.hwm_bytes,
            self.opts.lwm_bytes,
            self.opts.hwm_enqueue_count,
            &self.log,
        ));

        sessions.lock().insert(
            id,
            ServerSession {
                ep,
                eq: session.eq,
                txcq: session.txcq,
                rxcq: session.rxcq,
                _domain: session.domain,
                conn,
            },
        );
        self.pending.lock().insert(id);

        logging::debug!(self.log, "connection accepted, awaiting establishment";
                        "context" => "accept",
                        "connection_id" => id);
        Ok(())
    }

    /// One loop iteration: listener CM events, per-session CM events,
    /// then completion batches per active session. Returns whether
    /// progress was made.
    pub fn poll_once(&self) -> TransportResult<bool> {
        let (listener, sessions) = match &self.mode {
            Mode::Msg {
                listener, sessions, ..
            } => (listener, sessions),
            Mode::Rdm { datagram } => return datagram.sync(),
        };

        let mut progress = false;

        // new connect requests
        let event = match listener.lock().as_mut() {
            Some(eq) => eq.read()?,
            None => None,
        };
        if let Some(event) = event {
            progress = true;
            match event {
                CmEvent::ConnectRequest(request) => self.on_connect_request(request)?,
                other => {
                    logging::warn!(self.log, "unexpected event on the listener";
                                   "context" => "poll",
                                   "event" => ?other);
                }
            }
        }

        // per-session CM events
        let ids: Vec<ConnectionId> = sessions.lock().keys().copied().collect();
        for id in ids {
            let event = match sessions.lock().get_mut(&id) {
                Some(session) => session.eq.read()?,
                None => continue,
            };
            let event = match event {
                Some(event) => event,
                None => continue,
            };
            progress = true;

            match event {
                CmEvent::Connected => self.on_session_connected(id)?,
                CmEvent::Shutdown => self.close_connection_inner(id, ErrorCode::Ok),
                CmEvent::ConnectRequest(_) => {
                    logging::warn!(self.log, "unexpected connect request on a session";
                                   "context" => "poll",
                                   "connection_id" => id);
                }
            }
        }

        // completion handling for established sessions
        let ids: Vec<ConnectionId> = self.active.lock().iter().copied().collect();
        let mut entries = [Completion::default(); COMPLETION_BATCH];
        for id in ids {
            let conn = match sessions.lock().get(&id) {
                Some(session) => session.conn.clone(),
                None => continue,
            };

            let drained = {
                let mut sessions = sessions.lock();
                let mut completer = self.completer.lock();
                match (sessions.get_mut(&id), completer.as_mut()) {
                    (Some(session), Some(completer)) => {
                        completer.read(&mut *session.txcq, &mut entries)?
                    }
                    _ => 0,
                }
            };
            for comp in &entries[..drained] {
                progress = true;
                if self.fold(id, conn.on_write_complete(ctx::is_credit(comp.ctx)), ErrorCode::WriteError) {
                    break;
                }
            }

            let drained = {
                let mut sessions = sessions.lock();
                let mut completer = self.completer.lock();
                match (sessions.get_mut(&id), completer.as_mut()) {
                    (Some(session), Some(completer)) => {
                        completer.read(&mut *session.rxcq, &mut entries)?
                    }
                    _ => 0,
                }
            };
            if drained > 0 {
                progress = true;
                let result = conn
                    .on_read_complete(drained)
                    .map(|_| ())
                    .and_then(|_| conn.pump_reads());
                if self.fold(id, result, ErrorCode::ReadError) {
                    continue;
                }

                let dispatch = self.dispatch.clone();
                let mut route_error = false;
                conn.handle_data_read(|mut packet| {
                    if dispatch.route(id, &mut packet).is_err() {
                        route_error = true;
                    }
                });
                if route_error {
                    self.close_connection_inner(id, ErrorCode::InvalidPacket);
                }
            }
        }

        // housekeeping: request timeouts
        let now = Instant::now();
        {
            let mut housekeeping = self.housekeeping.lock();
            if now.duration_since(*housekeeping) >= HOUSEKEEPING_INTERVAL {
                *housekeeping = now;
                if self.dispatch.sweep_timeouts(now) > 0 {
                    progress = true;
                }
            }
        }

        Ok(progress)
    }

    fn on_session_connected(&self, id: ConnectionId) -> TransportResult<()> {
        let conn = match &self.mode {
            Mode::Msg { sessions, .. } => {
                match sessions.lock().get(&id) {
                    Some(session) => session.conn.clone(),
                    None => return Ok(()),
                }
            }
            Mode::Rdm { .. } => return Ok(()),
        };

        conn.start()?;

        self.pending.lock().swap_remove(&id);
        self.active.lock().insert(id);

        logging::info!(self.log, "connection established";
                       "context" => "poll",
                       "connection_id" => id);

        if let Some(cb) = self.handle_new_connection.lock().as_mut() {
            cb(id);
        }
        Ok(())
    }

    fn fold(&self, id: ConnectionId, result: TransportResult<()>, code: ErrorCode) -> bool {
        match result {
            Ok(()) | Err(TransportError::Wait) => false,
            Err(err) => {
                logging::error!(self.log, "connection failed";
                                "context" => "poll",
                                "connection_id" => id,
                                "error" => ?err);
                self.close_connection_inner(id, code);
                true
            }
        }
    }

    fn close_connection_inner(&self, id: ConnectionId, code: ErrorCode) {
        let removed = match &self.mode {
            Mode::Msg { sessions, .. } => sessions.lock().remove(&id),
            Mode::Rdm { .. } => None,
        };

        let was_tracked = {
            let mut active = self.active.lock();
            let mut pending = self.pending.lock();
            active.swap_remove(&id) | pending.swap_remove(&id)
        };

        if let Some(session) = removed {
            session.conn.close(code);
            drop(session.ep.lock().shutdown());
        }

        if was_tracked {
            if let Some(cb) = self.handle_connection_close.lock().as_mut() {
                cb(id, code);
            }
        }
    }

    /// Closes one connection on user request.
    pub fn close_connection(&self, id: ConnectionId) {
        self.close_connection_inner(id, ErrorCode::Ok);
    }

    /// Sends a response correlated to a request received on `id`.
    pub fn send_response<M: Payload>(
        &self,
        id: ConnectionId,
        rid: &Reqid,
        payload: &M,
    ) -> TransportResult<()> {
        let conn = self
            .connection(id)
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;
        conn.send_packet(self.dispatch.make_response(rid, payload)?, None)
    }

    /// Sends an unsolicited message on `id`.
    pub fn send_message<M: Payload>(&self, id: ConnectionId, payload: &M) -> TransportResult<()> {
        let conn = self
            .connection(id)
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;
        conn.send_packet(self.dispatch.make_message(payload)?, None)
    }

    /// Servers can originate requests too; responses come back through
    /// the dispatcher exactly as on the client side.
    pub fn send_request<M: Payload>(
        &self,
        id: ConnectionId,
        payload: &M,
        ctx: Option<UserContext>,
        timeout: Option<Duration>,
    ) -> TransportResult<()> {
        let conn = self
            .connection(id)
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;

        let (rid, packet) = self.dispatch.begin_request(payload, ctx, timeout)?;
        if let Err(err) = conn.send_packet(packet, None) {
            self.dispatch.abort_request(&rid, ErrorCode::WriteError);
            return Err(err);
        }
        Ok(())
    }

    /// Spawns the dedicated loop thread.
    pub fn run(self: Arc<Self>) -> TransportResult<()> {
        if let Mode::Rdm { datagram } = &self.mode {
            return datagram.clone().run();
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let completer = Completer::new(self.opts.comp_method, &self.log)?;
        let server = self.clone();
        let log = logging::child(&self.log);

        *worker = Some(LoopThread::spawn("tachyon-server", completer, move || {
            match server.poll_once() {
                Ok(progress) => progress,
                Err(err) => {
                    logging::error!(log, "server loop error";
                                    "context" => "run",
                                    "error" => ?err);
                    false
                }
            }
        }));
        Ok(())
    }

    /// Stops listening and closes every connection.
    pub fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }

        let ids: Vec<ConnectionId> = {
            let active = self.active.lock();
            let pending = self.pending.lock();
            active.iter().chain(pending.iter()).copied().collect()
        };
        for id in ids {
            self.close_connection_inner(id, ErrorCode::Ok);
        }

        if let Mode::Msg { listener, .. } = &self.mode {
            *listener.lock() = None;
        }
        if let Mode::Rdm { datagram } = &self.mode {
            datagram.stop();
        }
    }
}

use crate::buffer::RingBuffer;
use crate::channel::Channel;
use crate::connection::{ctx, Connection, MsgPoster, PressureCb};
use crate::datagram::Datagram;
use crate::dispatch::{Dispatcher, UserContext};
use crate::eventloop::{Completer, LoopThread, COMPLETION_BATCH};
use crate::fabric::{
    access, CmEvent, Completion, CompletionQueue, Domain, EventQueue, Fabric, MsgEndpoint,
};
use ion::logging;
use ion::options::Options;
use ion::reqid::Reqid;
use ion::shared::{ErrorCode, ErrorType, Payload, TransportError, TransportResult};
use ion::StreamId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection-status callback fired on connect and close.
pub type StatusCb = Box<dyn FnMut(ErrorCode) + Send>;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ClientState {
    Init,
    Connecting,
    Connected,
    Disconnected,
}

struct MsgParts {
    ep: Arc<Mutex<Box<dyn MsgEndpoint>>>,
    eq: Box<dyn EventQueue>,
    txcq: Box<dyn CompletionQueue>,
    rxcq: Box<dyn CompletionQueue>,
    domain: Box<dyn Domain>,
    max_msg_size: usize,
}

enum Mode {
    /// Dedicated connection-oriented endpoint.
    Msg { fabric: Mutex<Box<dyn Fabric>> },
    /// One stream over a shared datagram multiplexer.
    Rdm {
        datagram: Arc<Datagram>,
        target: StreamId,
    },
}

/// Active side of a connection: connects to a peer, exposes the typed
/// dispatch surface, and drives its own event loop.
///
/// `start` only begins the connect; the installed connect callback reports
/// how it went. Requests, responses and messages are queued, never sent
/// inline.
pub struct Client {
    opts: Options,
    mode: Mode,
    state: Arc<Mutex<ClientState>>,
    msg: Mutex<Option<MsgParts>>,
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    dispatch: Arc<Dispatcher>,
    handle_connect: Arc<Mutex<Option<StatusCb>>>,
    handle_close: Arc<Mutex<Option<StatusCb>>>,
    pressure: Mutex<Option<(PressureCb, PressureCb)>>,
    completer: Mutex<Option<Completer>>,
    worker: Mutex<Option<LoopThread>>,
    housekeeping: Mutex<Instant>,
    log: logging::Logger,
}

impl Client {
    /// Client over a connection-oriented (MSG) endpoint.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        fabric: Box<dyn Fabric>,
        log: L,
    ) -> Client {
        let log = logging::child(log);
        Client {
            opts,
            mode: Mode::Msg {
                fabric: Mutex::new(fabric),
            },
            state: Arc::new(Mutex::new(ClientState::Init)),
            msg: Mutex::new(None),
            conn: Arc::new(Mutex::new(None)),
            dispatch: Arc::new(Dispatcher::new(&log)),
            handle_connect: Arc::new(Mutex::new(None)),
            handle_close: Arc::new(Mutex::new(None)),
            pressure: Mutex::new(None),
            completer: Mutex::new(None),
            worker: Mutex::new(None),
            housekeeping: Mutex::new(Instant::now()),
            log,
        }
    }

    /// Client over a shared datagram multiplexer, talking to the peer
    /// registered under `target`.
    pub fn new_rdm<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        datagram: Arc<Datagram>,
        target: StreamId,
        log: L,
    ) -> Client {
        let log = logging::child(log);
        Client {
            opts,
            mode: Mode::Rdm { datagram, target },
            state: Arc::new(Mutex::new(ClientState::Init)),
            msg: Mutex::new(None),
            conn: Arc::new(Mutex::new(None)),
            dispatch: Arc::new(Dispatcher::new(&log)),
            handle_connect: Arc::new(Mutex::new(None)),
            handle_close: Arc::new(Mutex::new(None)),
            pressure: Mutex::new(None),
            completer: Mutex::new(None),
            worker: Mutex::new(None),
            housekeeping: Mutex::new(Instant::now()),
            log,
        }
    }

    /// The typed handler registry; install request/message/response
    /// handlers here before `start`.
    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatch
    }

    pub fn set_handle_connect(&self, cb: StatusCb) {
        *self.handle_connect.lock() = Some(cb);
    }

    pub fn set_handle_close(&self, cb: StatusCb) {
        *self.handle_close.lock() = Some(cb);
    }

    /// Back-pressure callbacks, applied once the connection exists.
    pub fn register_back_pressure(&self, full: PressureCb, empty: PressureCb) {
        *self.pressure.lock() = Some((full, empty));
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock() == ClientState::Connected
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().clone()
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.connection().map_or(0, |conn| conn.outstanding_bytes())
    }

    pub fn outstanding_packets(&self) -> u64 {
        self.connection()
            .map_or(0, |conn| conn.outstanding_packets())
    }

    /// Begins the connect. The result arrives through the connect
    /// callback once the loop observes the CM event (MSG) or the
    /// confirm control message (RDM).
    pub fn start(&self) -> TransportResult<()> {
        let duplicate = {
            let mut state = self.state.lock();
            let current = *state;
            if current == ClientState::Init {
                *state = ClientState::Connecting;
                false
            } else {
                logging::error!(self.log, "start on a client not in init state";
                                "context" => "start",
                                "state" => ?current);
                true
            }
        };
        if duplicate {
            if let Some(cb) = self.handle_connect.lock().as_mut() {
                cb(ErrorCode::DuplicateOn);
            }
            return Err(TransportError::Fatal(ErrorType::Resource));
        }

        match &self.mode {
            Mode::Msg { fabric } => {
                let mut session = fabric.lock().connect_msg(&self.opts)?;
                session.ep.enable()?;
                session.ep.connect()?;

                *self.completer.lock() = Some(Completer::new(self.opts.comp_method, &self.log)?);
                {
                    let mut completer = self.completer.lock();
                    let completer = completer.as_mut().unwrap();
                    completer.register(&*session.txcq)?;
                    completer.register(&*session.rxcq)?;
                }

                *self.msg.lock() = Some(MsgParts {
                    ep: Arc::new(Mutex::new(session.ep)),
                    eq: session.eq,
                    txcq: session.txcq,
                    rxcq: session.rxcq,
                    domain: session.domain,
                    max_msg_size: session.max_msg_size,
                });

                logging::info!(self.log, "connect issued";
                               "context" => "start",
                               "dst" => %self.opts.dst_endpoint());
            }
            Mode::Rdm { datagram, target } => {
                let conn =
                    datagram.connect_peer(*target, self.opts.dst_endpoint().as_bytes())?;
                *self.conn.lock() = Some(conn);

                let state = self.state.clone();
                let handle_connect = self.handle_connect.clone();
                datagram.set_on_confirm(Box::new(move |_stream| {
                    *state.lock() = ClientState::Connected;
                    if let Some(cb) = handle_connect.lock().as_mut() {
                        cb(ErrorCode::Ok);
                    }
                }));

                let dispatch = self.dispatch.clone();
                let log = logging::child(&self.log);
                datagram.set_packet_sink(Box::new(move |stream, mut packet| {
                    if let Err(err) = dispatch.route(u64::from(stream), &mut packet) {
                        logging::error!(log, "failed to route packet";
                                        "context" => "sink",
                                        "stream" => stream,
                                        "error" => ?err);
                    }
                }));

                let dispatch = self.dispatch.clone();
                let mut last_sweep = Instant::now();
                datagram.set_housekeeping(Box::new(move || {
                    let now = Instant::now();
                    if now.duration_since(last_sweep) < HOUSEKEEPING_INTERVAL {
                        return false;
                    }
                    last_sweep = now;
                    dispatch.sweep_timeouts(now) > 0
                }));

                logging::info!(self.log, "datagram connect issued";
                               "context" => "start",
                               "target_stream" => *target);
            }
        }
        Ok(())
    }

    /// One loop iteration for the MSG variant: CM events, then bounded
    /// completion batches, then the dispatch and housekeeping work.
    /// Returns whether progress was made. The RDM variant is driven by its
    /// multiplexer's loop instead.
    pub fn poll_once(&self) -> TransportResult<bool> {
        let mut progress = false;

        // CM events first
        let event = {
            let mut msg = self.msg.lock();
            match msg.as_mut() {
                Some(parts) => parts.eq.read()?,
                None => None,
            }
        };
        if let Some(event) = event {
            progress = true;
            match event {
                CmEvent::Connected => self.on_connected()?,
                CmEvent::Shutdown => self.on_shutdown(ErrorCode::Ok),
                CmEvent::ConnectRequest(_) => {
                    logging::warn!(self.log, "unexpected connect request on a client";
                                   "context" => "poll");
                }
            }
        }

        let conn = self.connection();
        if let Some(conn) = conn {
            let mut entries = [Completion::default(); COMPLETION_BATCH];

            // TX completions
            let drained = {
                let mut msg = self.msg.lock();
                let mut completer = self.completer.lock();
                match (msg.as_mut(), completer.as_mut()) {
                    (Some(parts), Some(completer)) => {
                        completer.read(&mut *parts.txcq, &mut entries)?
                    }
                    _ => 0,
                }
            };
            for comp in &entries[..drained] {
                progress = true;
                if self
                    .fold(conn.on_write_complete(ctx::is_credit(comp.ctx)), ErrorCode::WriteError)
                {
                    return Ok(true);
                }
            }

            // RX completions
            let drained = {
                let mut msg = self.msg.lock();
                let mut completer = self.completer.lock();
                match (msg.as_mut(), completer.as_mut()) {
                    (Some(parts), Some(completer)) => {
                        completer.read(&mut *parts.rxcq, &mut entries)?
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
                if self.fold(result, ErrorCode::ReadError) {
                    return Ok(true);
                }

                let dispatch = self.dispatch.clone();
                let mut route_error = false;
                conn.handle_data_read(|mut packet| {
                    if dispatch.route(conn.id(), &mut packet).is_err() {
                        route_error = true;
                    }
                });
                if route_error {
                    self.close_with(ErrorCode::InvalidPacket);
                    return Ok(true);
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

    /// Folds a connection-level result; fatal errors close the client.
    /// Returns true when the client was closed.
    fn fold(&self, result: TransportResult<()>, code: ErrorCode) -> bool {
        match result {
            Ok(()) | Err(TransportError::Wait) => false,
            Err(err) => {
                logging::error!(self.log, "connection failed";
                                "context" => "poll",
                                "error" => ?err);
                self.close_with(code);
                true
            }
        }
    }

    fn on_connected(&self) -> TransportResult<()> {
        let conn = {
            let mut msg = self.msg.lock();
            let parts = msg
                .as_mut()
                .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;

            let ring_bytes = self.opts.buf_size.min(parts.max_msg_size);
            let tx_region = parts.domain.register(ring_bytes, access::MSG)?;
            let rx_region = parts.domain.register(ring_bytes, access::MSG)?;

            let tx = RingBuffer::new(tx_region, self.opts.no_buffers)?;
            let rx = RingBuffer::new(rx_region, self.opts.no_buffers)?;
            let channel = Channel::new(tx, rx, 0, 0, &self.log);
            let poster = MsgPoster::new(parts.ep.clone());

            Arc::new(Connection::new(
                1,
                channel,
                Box::new(poster),
                self.opts.max_packet_size,
                self.opts.hwm_bytes,
                self.opts.lwm_bytes,
                self.opts.hwm_enqueue_count,
                &self.log,
            ))
        };

        conn.start()?;

        if let Some((full, empty)) = self.pressure.lock().take() {
            conn.register_back_pressure(full, empty);
        }

        *self.conn.lock() = Some(conn);
        *self.state.lock() = ClientState::Connected;

        logging::info!(self.log, "connected"; "context" => "poll");

        if let Some(cb) = self.handle_connect.lock().as_mut() {
            cb(ErrorCode::Ok);
        }
        Ok(())
    }

    fn on_shutdown(&self, code: ErrorCode) {
        logging::info!(self.log, "peer shut the connection down";
                       "context" => "poll");

        // a shutdown before establishment is a rejected connect
        let code = if *self.state.lock() == ClientState::Connecting {
            ErrorCode::ConnectError
        } else {
            code
        };
        self.close_with(code);
    }

    fn close_with(&self, code: ErrorCode) {
        let was = {
            let mut state = self.state.lock();
            if *state == ClientState::Disconnected {
                return;
            }
            let was = *state;
            *state = ClientState::Disconnected;
            was
        };

        if let Some(conn) = self.conn.lock().take() {
            conn.close(if code == ErrorCode::Ok {
                ErrorCode::Ok
            } else {
                ErrorCode::NotConnected
            });
        }

        // a failure before the connection was established reports through
        // the connect callback, not the close callback
        if was == ClientState::Connecting && code != ErrorCode::Ok {
            if let Some(cb) = self.handle_connect.lock().as_mut() {
                cb(ErrorCode::ConnectError);
            }
        } else if let Some(cb) = self.handle_close.lock().as_mut() {
            cb(code);
        }
    }

    /// Sends a typed request. The matching response handler fires with
    /// `Ok` and the payload, with `Timeout` after `timeout` expires, or
    /// with a failure code if the request could not leave the queue.
    pub fn send_request<M: Payload>(
        &self,
        payload: &M,
        ctx: Option<UserContext>,
        timeout: Option<Duration>,
    ) -> TransportResult<()> {
        if !self.is_connected() {
            logging::error!(self.log, "request on a disconnected client, dropping";
                            "context" => "send_request",
                            "type_name" => M::TYPE_NAME);
            self.dispatch.fail_request::<M>(ErrorCode::NotConnected);
            return Err(TransportError::Fatal(ErrorType::NotConnected));
        }

        let (rid, packet) = self.dispatch.begin_request(payload, ctx, timeout)?;

        let conn = self
            .connection()
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;
        if let Err(err) = conn.send_packet(packet, None) {
            self.dispatch.abort_request(&rid, ErrorCode::WriteError);
            return Err(err);
        }
        Ok(())
    }

    /// Sends a response correlated to a previously received request.
    pub fn send_response<M: Payload>(&self, rid: &Reqid, payload: &M) -> TransportResult<()> {
        if !self.is_connected() {
            logging::error!(self.log, "response on a disconnected client, dropping";
                            "context" => "send_response",
                            "type_name" => M::TYPE_NAME);
            return Err(TransportError::Fatal(ErrorType::NotConnected));
        }

        let packet = self.dispatch.make_response(rid, payload)?;
        let conn = self
            .connection()
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;
        conn.send_packet(packet, None)
    }

    /// Sends an unsolicited message (zero request id).
    pub fn send_message<M: Payload>(&self, payload: &M) -> TransportResult<()> {
        if !self.is_connected() {
            logging::error!(self.log, "message on a disconnected client, dropping";
                            "context" => "send_message",
                            "type_name" => M::TYPE_NAME);
            return Err(TransportError::Fatal(ErrorType::NotConnected));
        }

        let packet = self.dispatch.make_message(payload)?;
        let conn = self
            .connection()
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;
        conn.send_packet(packet, None)
    }

    /// Spawns the dedicated loop thread (MSG variant). RDM clients ride on
    /// their multiplexer's loop.
    pub fn run(self: Arc<Self>) -> TransportResult<()> {
        if let Mode::Rdm { datagram, .. } = &self.mode {
            return datagram.clone().run();
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let completer = Completer::new(self.opts.comp_method, &self.log)?;
        let client = self.clone();
        let log = logging::child(&self.log);

        *worker = Some(LoopThread::spawn("tachyon-client", completer, move || {
            match client.poll_once() {
                Ok(progress) => progress,
                Err(err) => {
                    logging::error!(log, "client loop error";
                                    "context" => "run",
                                    "error" => ?err);
                    client.close_with(ErrorCode::ReadError);
                    false
                }
            }
        }));
        Ok(())
    }

    /// Closes the connection. Queued packets are dropped; the close
    /// callback fires once.
    pub fn stop(&self) {
        if let Mode::Msg { .. } = &self.mode {
            if let Some(parts) = self.msg.lock().as_ref() {
                drop(parts.ep.lock().shutdown());
            }
        }

        self.close_with(ErrorCode::Ok);

        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

use crate::call::{
    CallController, CallSession, CallState, Command, PhoneState, RegistrationStatus,
};
use crate::config::{Config, Timers, TransportKind};
use crate::dialog::{self, Dialog, DialogState, Direction};
use crate::error::Error;
use crate::event::{self, Event, EventKind, EventReceiver, EventSender};
use crate::media::{AudioBridge, NullAudioBridge};
use crate::sdp::{self, MediaDirection};
use crate::transaction::{
    cseq_parts, generate_branch, via_branch, ClientTransaction, ResponseAction, ServerTransaction,
    TimerAction, TxKey,
};
use crate::transport::{Inbound, TcpTransport, TlsTransport, Transport, UdpTransport};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use rsip::headers::UntypedHeader;
use rsip::{Header, Method, Request, Response};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_EVENT_CAPACITY: usize = 256;

pub struct UserAgentBuilder {
    pub config: Option<Config>,
    pub cancel_token: Option<CancellationToken>,
    pub media: Option<Arc<dyn AudioBridge>>,
    pub event_capacity: usize,
}

/// The engine context object. Built once, served until cancelled; the UI
/// collaborator talks to it through [`CallController`], the state watch and
/// the event queue, never by touching signaling state directly.
pub struct UserAgent {
    pub config: Config,
    pub token: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PhoneState>,
    engine: Mutex<Option<Engine>>,
    events: Mutex<Option<EventReceiver>>,
    local_addr: SocketAddr,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            media: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_config(mut self, config: Option<Config>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn AudioBridge>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub async fn build(mut self) -> Result<UserAgent> {
        let token = self
            .cancel_token
            .take()
            .unwrap_or_else(CancellationToken::new);
        let config = self.config.take().unwrap_or_default();

        let local_ip = match &config.addr {
            Some(addr) if !addr.is_empty() => IpAddr::from_str(addr.as_str())?,
            _ => crate::net_tool::get_first_non_loopback_interface()?,
        };
        let local_addr: SocketAddr = SocketAddr::new(local_ip, config.port);

        let (host, port) = config.server_host_port();
        let server_addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| anyhow!("resolve {}: {}", config.server, e))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", config.server))?;

        let (net_tx, net_rx) = mpsc::unbounded_channel::<Inbound>();
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Udp => {
                UdpTransport::bind(local_addr, net_tx, token.child_token()).await?
            }
            TransportKind::Tcp => {
                TcpTransport::connect(server_addr, net_tx, token.child_token()).await?
            }
            TransportKind::Tls => {
                let ca = config
                    .tls_ca
                    .as_deref()
                    .ok_or_else(|| anyhow!("tls transport needs tls_ca in the configuration"))?;
                TlsTransport::connect(
                    server_addr,
                    host.clone(),
                    ca,
                    net_tx,
                    token.child_token(),
                )
                .await?
            }
        };
        let bound_addr = transport.local_addr();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = event::channel(self.event_capacity);
        let (state_tx, state_rx) = watch::channel(PhoneState::default());
        let media = self
            .media
            .take()
            .unwrap_or_else(|| Arc::new(NullAudioBridge));
        let timers = config.timers();

        let engine = Engine {
            config: config.clone(),
            token: token.clone(),
            transport,
            server_addr,
            timers,
            cmd_rx,
            net_rx,
            tick_rx,
            tick_tx,
            events: event_tx,
            state_tx,
            media,
            next_generation: 0,
            client_txs: HashMap::new(),
            server_txs: HashMap::new(),
            dialog: None,
            session: None,
            pending_invite: None,
            invite_server: None,
            pending_reinvite: false,
            invite_auth_retried: false,
            last_ack: None,
            registration: RegistrationCtx::new(&config),
        };

        Ok(UserAgent {
            config,
            token,
            cmd_tx,
            state_rx,
            engine: Mutex::new(Some(engine)),
            events: Mutex::new(Some(event_rx)),
            local_addr: bound_addr,
        })
    }
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgent {
    pub fn controller(&self) -> CallController {
        CallController::new(self.cmd_tx.clone(), self.state_rx.clone())
    }

    /// The event queue, available once.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().unwrap().take()
    }

    pub fn state(&self) -> watch::Receiver<PhoneState> {
        self.state_rx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the signaling task to completion. All transaction, dialog and
    /// registration state lives inside it; nothing here is shared.
    pub async fn serve(&self) -> Result<()> {
        let engine = self.engine.lock().unwrap().take();
        match engine {
            Some(engine) => engine.run().await,
            None => Err(anyhow!("engine already taken")),
        }
    }

    pub fn stop(&self) {
        info!("stopping");
        self.token.cancel();
    }
}

pub(crate) struct RegistrationCtx {
    pub status: RegistrationStatus,
    pub cseq: u32,
    pub call_id: String,
    pub from_tag: String,
    /// Bumped whenever the refresh/retry schedule changes; stale ticks are
    /// discarded by comparing against it.
    pub generation: u64,
    pub auth_failures: u32,
    pub backoff: Duration,
    pub failure_reported: bool,
}

impl RegistrationCtx {
    fn new(config: &Config) -> Self {
        Self {
            status: RegistrationStatus::Unregistered,
            cseq: 0,
            call_id: Uuid::new_v4().to_string(),
            from_tag: dialog::generate_tag(),
            generation: 0,
            auth_failures: 0,
            backoff: Duration::from_secs(config.register_retry_base_secs.max(1)),
            failure_reported: false,
        }
    }
}

/// Timer messages posted back into the engine queue. Each carries the
/// generation of the state it belongs to; a mismatch means the owner is
/// gone and the tick is a no-op.
#[derive(Debug, Clone)]
pub(crate) enum Tick {
    TxRetransmit { key: TxKey, generation: u64 },
    TxCleanup { key: TxKey, generation: u64 },
    ServerTxCleanup { key: TxKey, generation: u64 },
    RegisterRefresh { generation: u64 },
    RegisterRetry { generation: u64 },
}

pub(crate) struct Engine {
    pub config: Config,
    pub token: CancellationToken,
    pub transport: Arc<dyn Transport>,
    pub server_addr: SocketAddr,
    pub timers: Timers,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    net_rx: mpsc::UnboundedReceiver<Inbound>,
    tick_rx: mpsc::UnboundedReceiver<Tick>,
    tick_tx: mpsc::UnboundedSender<Tick>,
    pub events: EventSender,
    pub state_tx: watch::Sender<PhoneState>,
    pub media: Arc<dyn AudioBridge>,
    next_generation: u64,
    pub client_txs: HashMap<TxKey, ClientTransaction>,
    pub server_txs: HashMap<TxKey, ServerTransaction>,
    pub dialog: Option<Dialog>,
    pub session: Option<CallSession>,
    /// Outbound INVITE awaiting its final response.
    pub pending_invite: Option<TxKey>,
    /// Server transaction of the incoming INVITE currently ringing.
    pub invite_server: Option<TxKey>,
    pub pending_reinvite: bool,
    pub invite_auth_retried: bool,
    /// Last ACK we sent for a 2xx, replayed when the 200 is retransmitted.
    pub last_ack: Option<Bytes>,
    pub registration: RegistrationCtx,
}

impl Engine {
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(
            local = %self.transport.local_addr(),
            server = %self.server_addr,
            "engine started"
        );
        if self.config.register {
            self.start_registration().await;
        }
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(command) = self.cmd_rx.recv() => self.on_command(command).await,
                Some((data, source)) = self.net_rx.recv() => self.on_inbound(data, source).await,
                Some(tick) = self.tick_rx.recv() => self.on_tick(tick).await,
            }
        }
        self.shutdown().await;
        info!("engine stopped");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.session.as_ref().map(|s| s.state.is_in_call()) == Some(true) {
            self.terminate_call().await;
        }
        if self.registration.status == RegistrationStatus::Registered {
            self.unregister().await;
            // Give the wire a moment before the sockets go away.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub(crate) fn next_gen(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn schedule(&self, delay: Duration, tick: Tick) {
        let tx = self.tick_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    tx.send(tick).ok();
                }
            }
        });
    }

    pub(crate) fn emit(&self, kind: EventKind, detail: impl Into<String>) {
        let session_id = self.session.as_ref().map(|s| s.id.clone());
        self.events.send(Event::new(kind, session_id, detail));
    }

    pub(crate) fn publish<F: FnOnce(&mut PhoneState)>(&self, update: F) {
        self.state_tx.send_modify(update);
    }

    pub(crate) fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.domain())
    }

    pub(crate) fn contact_header(&self) -> Header {
        Header::Contact(
            format!(
                "<sip:{}@{}>",
                self.config.username,
                self.transport.local_addr()
            )
            .into(),
        )
    }

    /// Hop-by-hop headers a request needs just before the wire: Via (unless
    /// the caller built one, as CANCEL and failure-ACKs do), Contact where
    /// the method forms a dialog or binding, User-Agent, Content-Length.
    pub(crate) fn finalize(&self, mut request: Request) -> Request {
        let has_via = request
            .headers
            .iter()
            .any(|h| matches!(h, Header::Via(_)));
        if !has_via {
            request.headers.push(Header::Via(
                format!(
                    "SIP/2.0/{} {};branch={}",
                    self.config.transport.via_token(),
                    self.transport.local_addr(),
                    generate_branch()
                )
                .into(),
            ));
        }
        let has_contact = request
            .headers
            .iter()
            .any(|h| matches!(h, Header::Contact(_)));
        if !has_contact && matches!(request.method, Method::Invite | Method::Register) {
            request.headers.push(self.contact_header());
        }
        let has_ua = request
            .headers
            .iter()
            .any(|h| matches!(h, Header::UserAgent(_)));
        if !has_ua {
            request
                .headers
                .push(Header::UserAgent(self.config.user_agent().into()));
        }
        let has_length = request
            .headers
            .iter()
            .any(|h| matches!(h, Header::ContentLength(_)));
        if !has_length {
            request.headers.push(Header::ContentLength(
                request.body.len().to_string().into(),
            ));
        }
        request
    }

    pub(crate) fn with_body(mut request: Request, content_type: &str, body: String) -> Request {
        request
            .headers
            .push(Header::ContentType(content_type.to_string().into()));
        request.body = body.into_bytes();
        request
    }

    pub(crate) async fn send_wire(&self, data: Bytes, destination: SocketAddr) {
        if let Err(e) = self.transport.send(data, destination).await {
            warn!("send to {} failed: {}", destination, e);
        }
    }

    /// Send a request under a client transaction: retransmission, matching
    /// and the timeout deadline all hang off the returned key.
    pub(crate) async fn send_request(
        &mut self,
        request: Request,
        destination: SocketAddr,
    ) -> crate::error::Result<TxKey> {
        let request = self.finalize(request);
        let branch = via_branch(&request.headers)
            .ok_or_else(|| Error::Protocol("request lost its Via".to_string()))?;
        let key = TxKey::new(branch, &request.method);
        let generation = self.next_gen();
        let tx = ClientTransaction::new(
            key.clone(),
            request,
            destination,
            self.config.transport.is_reliable(),
            self.timers,
            generation,
        );
        let first = tx.first_interval();
        let wire = tx.wire.clone();
        self.client_txs.insert(key.clone(), tx);
        self.send_wire(wire, destination).await;
        self.schedule(
            first,
            Tick::TxRetransmit {
                key: key.clone(),
                generation,
            },
        );
        Ok(key)
    }

    /// Send without a transaction (ACK).
    pub(crate) async fn send_plain(&self, request: Request, destination: SocketAddr) -> Bytes {
        let request = self.finalize(request);
        let wire = Bytes::from(request.to_string());
        self.send_wire(wire.clone(), destination).await;
        wire
    }

    async fn on_inbound(&mut self, data: Bytes, source: SocketAddr) {
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return; // keep-alive
        }
        if data.starts_with(b"SIP/") {
            match Response::try_from(&data[..]) {
                Ok(response) => self.on_response(response).await,
                Err(e) => debug!("discarding malformed response from {}: {}", source, e),
            }
        } else {
            match Request::try_from(&data[..]) {
                Ok(request) => self.on_request(request, source).await,
                Err(e) => debug!("discarding malformed request from {}: {}", source, e),
            }
        }
    }

    async fn on_response(&mut self, response: Response) {
        let status = u16::from(response.status_code.clone());
        let Some(branch) = via_branch(&response.headers) else {
            debug!("response without Via branch, discarded");
            return;
        };
        let Some((cseq, method)) = cseq_parts(&response.headers) else {
            debug!("response without CSeq, discarded");
            return;
        };
        let key = TxKey {
            branch,
            method: method.clone(),
        };

        let matched = self.client_txs.get_mut(&key).map(|tx| {
            let action = tx.on_response(status);
            (
                action,
                tx.is_invite,
                tx.request.clone(),
                tx.destination,
                tx.generation,
                tx.is_terminated(),
                tx.linger(),
                tx.ack.clone(),
            )
        });
        let Some((action, is_invite, request, destination, generation, terminated, linger, stored_ack)) =
            matched
        else {
            // A retransmitted 200 after the INVITE transaction is gone:
            // answer it with the ACK we already built.
            if method == "INVITE" && (200..300).contains(&status) {
                if let (Some(ack), Some(dialog)) = (self.last_ack.clone(), self.dialog.as_ref()) {
                    let destination = dialog.remote_addr;
                    self.send_wire(ack, destination).await;
                }
            }
            return;
        };

        match action {
            ResponseAction::Absorb => {
                // Duplicate final response; re-ACK failures so the peer
                // stops retransmitting.
                if let Some(ack) = stored_ack {
                    self.send_wire(ack, destination).await;
                }
            }
            ResponseAction::PassUp => {
                if status >= 200 {
                    if is_invite && status >= 300 {
                        let ack = dialog::ack_for_failure(&request, &response);
                        let wire = Bytes::from(self.finalize(ack).to_string());
                        if let Some(tx) = self.client_txs.get_mut(&key) {
                            tx.ack = Some(wire.clone());
                        }
                        self.send_wire(wire, destination).await;
                    }
                    if terminated {
                        self.client_txs.remove(&key);
                    } else {
                        self.schedule(
                            linger,
                            Tick::TxCleanup {
                                key: key.clone(),
                                generation,
                            },
                        );
                    }
                }
                match method.as_str() {
                    "REGISTER" => self.on_register_response(status, &response).await,
                    "INVITE" => self.on_invite_response(status, cseq, &response).await,
                    "BYE" => {
                        debug!(status, "BYE answered");
                        if let Some(dialog) = self.dialog.as_mut() {
                            dialog.terminate();
                        }
                    }
                    "CANCEL" => debug!(status, "CANCEL answered"),
                    _ => debug!(status, method = %method, "response passed up"),
                }
            }
        }
    }

    async fn on_tick(&mut self, tick: Tick) {
        match tick {
            Tick::TxRetransmit { key, generation } => {
                let Some(tx) = self.client_txs.get_mut(&key) else {
                    return;
                };
                if tx.generation != generation {
                    return;
                }
                match tx.on_timer() {
                    TimerAction::Retransmit { next } => {
                        let wire = tx.wire.clone();
                        let destination = tx.destination;
                        self.send_wire(wire, destination).await;
                        self.schedule(next, Tick::TxRetransmit { key, generation });
                    }
                    TimerAction::Reschedule { next } => {
                        self.schedule(next, Tick::TxRetransmit { key, generation });
                    }
                    TimerAction::Timeout => {
                        self.client_txs.remove(&key);
                        self.on_transaction_timeout(&key).await;
                    }
                    TimerAction::None => {}
                }
            }
            Tick::TxCleanup { key, generation } => {
                if let Some(tx) = self.client_txs.get(&key) {
                    if tx.generation == generation {
                        self.client_txs.remove(&key);
                    }
                }
            }
            Tick::ServerTxCleanup { key, generation } => {
                if let Some(tx) = self.server_txs.get(&key) {
                    if tx.generation == generation {
                        self.server_txs.remove(&key);
                    }
                }
            }
            Tick::RegisterRefresh { generation } => {
                if self.registration.generation == generation {
                    debug!("registration refresh due");
                    self.send_register(None).await;
                }
            }
            Tick::RegisterRetry { generation } => {
                if self.registration.generation == generation {
                    self.send_register(None).await;
                }
            }
        }
    }

    async fn on_transaction_timeout(&mut self, key: &TxKey) {
        warn!(method = %key.method, "transaction timed out");
        match key.method.as_str() {
            "REGISTER" => {
                self.on_register_failure("registration request timed out".to_string())
                    .await;
            }
            "INVITE" | "BYE" | "CANCEL" => {
                let in_call = self
                    .session
                    .as_ref()
                    .map(|s| s.state.is_in_call())
                    .unwrap_or(false);
                self.emit(
                    EventKind::TransactionTimeout,
                    format!("{} got no final response", key.method),
                );
                if in_call {
                    self.end_call(CallState::Ended, "Call Ended");
                }
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.terminate();
                }
            }
            _ => {}
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::PlaceCall { destination } => self.place_call(destination).await,
            Command::Answer => self.answer().await,
            Command::Reject => {
                if self.reject_pending().await {
                    self.end_call(CallState::Rejected, "Call Rejected");
                    self.emit(EventKind::CallTerminated, "rejected");
                } else {
                    self.hang_up_active("Call Rejected").await;
                }
            }
            Command::HangUp => self.hang_up_active("Call Ended").await,
            Command::Hold => self.hold().await,
            Command::Resume => self.resume().await,
            Command::ToggleMute => self.toggle_mute().await,
            Command::ToggleSpeaker => self.toggle_speaker(),
        }
    }

    async fn place_call(&mut self, destination: String) {
        if self
            .session
            .as_ref()
            .map(|s| s.state.is_in_call())
            .unwrap_or(false)
        {
            debug!("place_call ignored, a call is already in progress");
            return;
        }
        let domain = self.config.domain();
        let remote_uri = if destination.contains('@') {
            if destination.starts_with("sip:") {
                destination.clone()
            } else {
                format!("sip:{}", destination)
            }
        } else {
            format!("sip:{}@{}", destination, domain)
        };
        let mut dialog = Dialog::new_outbound(self.local_uri(), remote_uri, self.server_addr);
        let body = sdp::audio_body(
            &self.config.username,
            &self.transport.local_addr().ip().to_string(),
            self.config.rtp_port,
            MediaDirection::SendRecv,
        );
        let request = match dialog.request(Method::Invite) {
            Ok(request) => Self::with_body(request, "application/sdp", body),
            Err(e) => {
                warn!("cannot build INVITE for {}: {}", destination, e);
                self.emit(EventKind::CallTerminated, format!("invalid destination: {}", e));
                return;
            }
        };
        let call_id = dialog.call_id.clone();
        let peer = dialog::uri_user(&dialog.remote_uri).unwrap_or_else(|| destination.clone());
        match self.send_request(request, self.server_addr).await {
            Ok(key) => {
                self.pending_invite = Some(key);
                self.invite_auth_retried = false;
                self.dialog = Some(dialog);
                self.session = Some(CallSession::outbound(call_id, peer.clone()));
                let status = format!("Calling {}...", peer);
                self.publish(|s| {
                    s.call = CallState::Calling;
                    s.call_status = status.clone();
                    s.is_incoming_call = false;
                    s.incoming_call_number.clear();
                    s.call_started_at = None;
                });
                self.emit(EventKind::CallStateChanged, format!("calling {}", peer));
                info!(peer = %peer, "outbound call started");
            }
            Err(e) => {
                warn!("INVITE send failed: {}", e);
                self.emit(EventKind::CallTerminated, format!("network error: {}", e));
            }
        }
    }

    async fn on_invite_response(&mut self, status: u16, cseq: u32, response: &Response) {
        let Some(dialog) = self.dialog.as_mut() else {
            return;
        };
        // On a confirmed dialog this is a re-INVITE response (hold/resume);
        // the session state already flipped locally, it only needs its ACK.
        if dialog.state == DialogState::Confirmed {
            if status >= 200 {
                self.pending_reinvite = false;
            }
            if (200..300).contains(&status) {
                if let Ok(ack) = dialog.ack(cseq) {
                    let destination = dialog.remote_addr;
                    self.send_plain(ack, destination).await;
                }
            } else if status >= 300 {
                debug!(status, "re-INVITE refused, keeping the session up");
            }
            return;
        }

        let in_call = self
            .session
            .as_ref()
            .map(|s| s.state.is_in_call())
            .unwrap_or(false);
        if !in_call {
            debug!(status, "INVITE response for a finished call, ignored");
            return;
        }

        match status {
            100 => {}
            101..=199 => {
                dialog.on_provisional(response);
                let peer = self.session.as_ref().map(|s| s.peer.clone()).unwrap_or_default();
                if let Some(session) = self.session.as_mut() {
                    if session.state == CallState::Calling {
                        session.state = CallState::Ringing;
                    }
                }
                self.publish(|s| {
                    s.call = CallState::Ringing;
                    s.call_status = format!("Ringing {}...", peer);
                });
                self.emit(EventKind::CallStateChanged, "ringing");
            }
            200..=299 => {
                dialog.confirm(response);
                let destination = dialog.remote_addr;
                match dialog.ack(cseq) {
                    Ok(ack) => {
                        let wire = self.send_plain(ack, destination).await;
                        self.last_ack = Some(wire);
                    }
                    Err(e) => warn!("cannot build ACK: {}", e),
                }
                self.pending_invite = None;
                self.connect_session().await;
            }
            401 | 407 => {
                self.retry_invite_with_auth(status, response).await;
            }
            _ => {
                self.pending_invite = None;
                let detail = format!("call failed: {}", status);
                self.end_call(CallState::Ended, "Call Ended");
                self.emit(EventKind::CallTerminated, detail);
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.terminate();
                }
            }
        }
    }

    async fn retry_invite_with_auth(&mut self, status: u16, response: &Response) {
        if self.invite_auth_retried {
            self.pending_invite = None;
            self.end_call(CallState::Ended, "Call Ended");
            self.emit(
                EventKind::CallTerminated,
                format!("authentication failed ({})", status),
            );
            return;
        }
        let Some((challenge, proxy)) = Self::challenge_from(response) else {
            self.end_call(CallState::Ended, "Call Ended");
            self.emit(EventKind::CallTerminated, "challenge without digest parameters");
            return;
        };
        self.invite_auth_retried = true;
        let Some(dialog) = self.dialog.as_mut() else {
            return;
        };
        let uri = dialog.remote_target.clone();
        let value = crate::auth::authorization(
            &self.config.credential(),
            &challenge,
            "INVITE",
            &uri,
        );
        let header = if proxy {
            Header::ProxyAuthorization(value.into())
        } else {
            Header::Authorization(value.into())
        };
        let body = sdp::audio_body(
            &self.config.username,
            &self.transport.local_addr().ip().to_string(),
            self.config.rtp_port,
            MediaDirection::SendRecv,
        );
        let request = match dialog.request(Method::Invite) {
            Ok(mut request) => {
                request.headers.push(header);
                Self::with_body(request, "application/sdp", body)
            }
            Err(e) => {
                warn!("cannot rebuild INVITE: {}", e);
                return;
            }
        };
        match self.send_request(request, self.server_addr).await {
            Ok(key) => self.pending_invite = Some(key),
            Err(e) => warn!("authenticated INVITE send failed: {}", e),
        }
    }

    pub(crate) fn challenge_from(
        response: &Response,
    ) -> Option<(crate::auth::DigestChallenge, bool)> {
        response.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(v) => crate::auth::DigestChallenge::parse(v.value())
                .ok()
                .map(|c| (c, false)),
            Header::ProxyAuthenticate(v) => crate::auth::DigestChallenge::parse(v.value())
                .ok()
                .map(|c| (c, true)),
            _ => None,
        })
    }

    /// Session goes Connected: audio up, state published.
    pub(crate) async fn connect_session(&mut self) {
        let peer = match self.session.as_mut() {
            Some(session) => {
                session.connect();
                session.peer.clone()
            }
            None => return,
        };
        let started_at = self.session.as_ref().and_then(|s| s.started_at);
        let muted = self.state_tx.borrow().is_muted;
        if self.config.enable_microphone && self.config.audio_transmit {
            if let Err(e) = self.media.start_audio().await {
                warn!("audio start failed: {}", e);
            }
            if let Err(e) = self.media.set_mute(muted).await {
                warn!("audio mute sync failed: {}", e);
            }
        }
        let status = format!("In Call with {}", peer);
        self.publish(|s| {
            s.call = CallState::Connected;
            s.call_status = status.clone();
            s.is_incoming_call = false;
            s.incoming_call_number.clear();
            s.call_started_at = started_at;
        });
        self.emit(EventKind::CallStateChanged, format!("connected to {}", peer));
        info!(peer = %peer, "call connected");
    }

    /// Local session teardown: state, audio, watch. Signaling (BYE/CANCEL/
    /// 603) happens at the call sites; events too, so each cause reports
    /// exactly once.
    pub(crate) fn end_call(&mut self, state: CallState, status: &str) {
        if let Some(session) = self.session.as_mut() {
            if session.state.is_terminal() {
                return;
            }
            session.end(state);
        } else {
            return;
        }
        let media = self.media.clone();
        tokio::spawn(async move {
            media.stop_audio().await.ok();
        });
        let status = status.to_string();
        self.publish(move |s| {
            s.call = state;
            s.call_status = status;
            s.is_incoming_call = false;
            s.incoming_call_number.clear();
            s.call_started_at = None;
        });
        self.pending_invite = None;
        self.pending_reinvite = false;
        self.invite_auth_retried = false;
        self.invite_server = None;
    }

    /// Best-effort signaling for ending the current call, then local
    /// teardown. Used by hang-up and by the duration-report quirk.
    pub(crate) async fn terminate_call(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if !session.state.is_in_call() {
            return false;
        }
        let state = session.state;
        let direction = session.direction;
        match (state, direction) {
            (CallState::Ringing, Direction::Inbound) => {
                self.reject_pending().await;
            }
            (CallState::Calling | CallState::Ringing, Direction::Outbound) => {
                // No final response yet: CANCEL rides the INVITE's branch.
                let invite = self
                    .pending_invite
                    .as_ref()
                    .and_then(|key| self.client_txs.get(key))
                    .map(|tx| tx.request.clone());
                if let Some(invite) = invite {
                    let cancel = dialog::cancel_for(&invite);
                    if let Err(e) = self.send_request(cancel, self.server_addr).await {
                        warn!("CANCEL send failed: {}", e);
                    }
                }
            }
            _ => {
                let bye = self.dialog.as_mut().and_then(|d| d.request(Method::Bye).ok());
                let destination = self
                    .dialog
                    .as_ref()
                    .map(|d| d.remote_addr)
                    .unwrap_or(self.server_addr);
                if let Some(bye) = bye {
                    if let Err(e) = self.send_request(bye, destination).await {
                        warn!("BYE send failed: {}", e);
                    }
                }
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.terminate();
                }
            }
        }
        true
    }

    async fn hang_up_active(&mut self, status: &str) {
        if self.terminate_call().await {
            let state = if status == "Call Rejected" {
                CallState::Rejected
            } else {
                CallState::Ended
            };
            self.end_call(state, status);
            self.emit(EventKind::CallTerminated, "hung up");
        } else {
            debug!("hang up with no active call, ignored");
        }
    }

    async fn hold(&mut self) {
        let connected = self
            .session
            .as_ref()
            .map(|s| s.state == CallState::Connected)
            .unwrap_or(false);
        if !connected {
            debug!("hold ignored outside a connected call");
            return;
        }
        if self.reinvite(MediaDirection::SendOnly).await {
            if let Some(session) = self.session.as_mut() {
                session.state = CallState::Held;
            }
            if let Err(e) = self.media.stop_audio().await {
                warn!("audio stop failed: {}", e);
            }
            self.publish(|s| {
                s.call = CallState::Held;
                s.call_status = "Call on Hold".to_string();
            });
            self.emit(EventKind::CallStateChanged, "held");
        }
    }

    async fn resume(&mut self) {
        let held = self
            .session
            .as_ref()
            .map(|s| s.state == CallState::Held)
            .unwrap_or(false);
        if !held {
            debug!("resume ignored outside a held call");
            return;
        }
        if self.reinvite(MediaDirection::SendRecv).await {
            let peer = self
                .session
                .as_ref()
                .map(|s| s.peer.clone())
                .unwrap_or_default();
            if let Some(session) = self.session.as_mut() {
                session.state = CallState::Connected;
            }
            if self.config.enable_microphone && self.config.audio_transmit {
                if let Err(e) = self.media.start_audio().await {
                    warn!("audio start failed: {}", e);
                }
            }
            self.publish(|s| {
                s.call = CallState::Connected;
                s.call_status = format!("In Call with {}", peer);
            });
            self.emit(EventKind::CallStateChanged, "resumed");
        }
    }

    /// Send the hold/resume re-INVITE. The session state flips locally right
    /// away; the response only needs ACKing.
    async fn reinvite(&mut self, direction: MediaDirection) -> bool {
        let body = sdp::audio_body(
            &self.config.username,
            &self.transport.local_addr().ip().to_string(),
            self.config.rtp_port,
            direction,
        );
        let Some(dialog) = self.dialog.as_mut() else {
            return false;
        };
        if dialog.state != DialogState::Confirmed {
            debug!("re-INVITE needs a confirmed dialog");
            return false;
        }
        let destination = dialog.remote_addr;
        let request = match dialog.request(Method::Invite) {
            Ok(request) => Self::with_body(request, "application/sdp", body),
            Err(e) => {
                warn!("cannot build re-INVITE: {}", e);
                return false;
            }
        };
        match self.send_request(request, destination).await {
            Ok(_) => {
                self.pending_reinvite = true;
                true
            }
            Err(e) => {
                warn!("re-INVITE send failed: {}", e);
                false
            }
        }
    }

    async fn toggle_mute(&mut self) {
        let muted = !self.state_tx.borrow().is_muted;
        if let Some(session) = self.session.as_mut() {
            session.muted = muted;
        }
        if let Err(e) = self.media.set_mute(muted).await {
            warn!("audio mute failed: {}", e);
        }
        self.publish(|s| s.is_muted = muted);
        debug!(muted, "mute toggled");
    }

    fn toggle_speaker(&mut self) {
        let speaker_on = !self.state_tx.borrow().is_speaker_on;
        self.publish(|s| s.is_speaker_on = speaker_on);
        // Routing itself belongs to the platform audio collaborator.
        self.emit(
            EventKind::SpeakerChanged,
            if speaker_on { "on" } else { "off" },
        );
    }
}

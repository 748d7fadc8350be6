//! SIP transaction layer (RFC 3261 section 17).
//!
//! Transactions here are plain state machines: the engine task owns them,
//! feeds them responses and timer firings, and performs whatever send or
//! event the returned action asks for. Timer firings arrive as messages
//! tagged with the transaction's generation, so a timer that outlives its
//! transaction is discarded instead of touching freed state.

use crate::config::Timers;
use bytes::Bytes;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Request};
use std::net::SocketAddr;
use std::time::Duration;

pub const BRANCH_MAGIC: &str = "z9hG4bK";

pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC, rand::random::<u64>())
}

/// Transactions are matched on the Via branch plus the CSeq method, which
/// keeps an INVITE and the CANCEL that shares its branch apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxKey {
    pub branch: String,
    pub method: String,
}

impl TxKey {
    pub fn new(branch: impl Into<String>, method: &rsip::Method) -> Self {
        Self {
            branch: branch.into(),
            method: method.to_string(),
        }
    }
}

/// Branch parameter of the topmost Via header.
pub fn via_branch(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::Via(via) => via
            .value()
            .split(';')
            .find(|p| p.trim().starts_with("branch="))
            .and_then(|p| p.split('=').nth(1))
            .map(|s| s.trim().to_string()),
        _ => None,
    })
}

/// Sequence number and method out of the CSeq header.
pub fn cseq_parts(headers: &Headers) -> Option<(u32, String)> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(cseq) => {
            let mut parts = cseq.value().split_whitespace();
            let seq = parts.next()?.parse().ok()?;
            let method = parts.next()?.to_string();
            Some((seq, method))
        }
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// What the engine must do after a retransmission timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Resend the request and re-arm the timer.
    Retransmit { next: Duration },
    /// Re-arm only; retransmission stopped but the overall deadline stands.
    Reschedule { next: Duration },
    /// The retransmission ceiling elapsed without a final response.
    Timeout,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// First sighting, hand the response to the transaction user.
    PassUp,
    /// Retransmitted response, absorbed here.
    Absorb,
}

pub struct ClientTransaction {
    pub key: TxKey,
    pub request: Request,
    /// Serialized request, kept for retransmission.
    pub wire: Bytes,
    pub destination: SocketAddr,
    pub state: TxState,
    pub generation: u64,
    pub is_invite: bool,
    /// ACK for a non-2xx final response, resent when the response repeats.
    pub ack: Option<Bytes>,
    timers: Timers,
    reliable: bool,
    interval: Duration,
    elapsed: Duration,
}

impl ClientTransaction {
    pub fn new(
        key: TxKey,
        request: Request,
        destination: SocketAddr,
        reliable: bool,
        timers: Timers,
        generation: u64,
    ) -> Self {
        let is_invite = request.method == rsip::Method::Invite;
        let wire = Bytes::from(request.to_string());
        // Reliable transports skip retransmission; the only timer left is
        // the overall deadline.
        let interval = if reliable { timers.timeout() } else { timers.t1 };
        Self {
            key,
            request,
            wire,
            destination,
            state: TxState::Calling,
            generation,
            is_invite,
            ack: None,
            timers,
            reliable,
            interval,
            elapsed: Duration::ZERO,
        }
    }

    /// Delay before the first timer firing.
    pub fn first_interval(&self) -> Duration {
        self.interval
    }

    pub fn on_timer(&mut self) -> TimerAction {
        match self.state {
            TxState::Calling | TxState::Proceeding => {
                self.elapsed += self.interval;
                if self.elapsed >= self.timers.timeout() {
                    self.state = TxState::Terminated;
                    return TimerAction::Timeout;
                }
                // An INVITE stops retransmitting once a provisional response
                // proves the request arrived; non-INVITEs keep going.
                let retransmit =
                    !self.reliable && (self.state == TxState::Calling || !self.is_invite);
                self.interval = std::cmp::min(self.interval * 2, self.timers.t2);
                if retransmit {
                    TimerAction::Retransmit {
                        next: self.interval,
                    }
                } else {
                    TimerAction::Reschedule {
                        next: self.interval,
                    }
                }
            }
            TxState::Completed | TxState::Terminated => TimerAction::None,
        }
    }

    pub fn on_response(&mut self, status: u16) -> ResponseAction {
        match self.state {
            TxState::Calling | TxState::Proceeding => {
                if status < 200 {
                    self.state = TxState::Proceeding;
                } else if status < 300 && self.is_invite {
                    // 2xx ACKs are the dialog's business; nothing left here.
                    self.state = TxState::Terminated;
                } else {
                    self.state = TxState::Completed;
                }
                ResponseAction::PassUp
            }
            TxState::Completed | TxState::Terminated => ResponseAction::Absorb,
        }
    }

    /// How long a completed transaction lingers to absorb late responses
    /// (timer D for INVITE, timer K otherwise).
    pub fn linger(&self) -> Duration {
        if self.reliable {
            Duration::ZERO
        } else if self.is_invite {
            std::cmp::max(Duration::from_secs(32), self.timers.t4)
        } else {
            self.timers.t4
        }
    }

    pub fn terminate(&mut self) {
        self.state = TxState::Terminated;
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TxState::Terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTxState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Just enough UAS-side state to absorb request retransmissions, replay the
/// last response, and notice the ACK that closes an INVITE exchange.
pub struct ServerTransaction {
    pub key: TxKey,
    pub request: Request,
    pub source: SocketAddr,
    pub state: ServerTxState,
    pub generation: u64,
    pub is_invite: bool,
    pub last_response: Option<Bytes>,
    timers: Timers,
    reliable: bool,
}

impl ServerTransaction {
    pub fn new(
        key: TxKey,
        request: Request,
        source: SocketAddr,
        reliable: bool,
        timers: Timers,
        generation: u64,
    ) -> Self {
        let is_invite = request.method == rsip::Method::Invite;
        Self {
            key,
            request,
            source,
            state: ServerTxState::Proceeding,
            generation,
            is_invite,
            last_response: None,
            timers,
            reliable,
        }
    }

    /// Record a response we sent. For a final response, returns how long to
    /// keep the transaction around before cleanup.
    pub fn record_response(&mut self, status: u16, wire: Bytes) -> Option<Duration> {
        self.last_response = Some(wire);
        if status < 200 {
            return None;
        }
        self.state = ServerTxState::Completed;
        if self.reliable {
            Some(Duration::ZERO)
        } else {
            Some(self.timers.timeout())
        }
    }

    /// A retransmitted request; the caller resends this.
    pub fn retransmission_reply(&self) -> Option<Bytes> {
        self.last_response.clone()
    }

    /// ACK received for our final response. Returns the cleanup delay when
    /// the ACK actually closes the exchange.
    pub fn on_ack(&mut self) -> Option<Duration> {
        if self.is_invite && self.state == ServerTxState::Completed {
            self.state = ServerTxState::Confirmed;
            Some(self.timers.t4)
        } else {
            None
        }
    }

    pub fn terminate(&mut self) {
        self.state = ServerTxState::Terminated;
    }
}

//! UI-facing call control: the command handle, the single call session, and
//! the observable state store.
//!
//! The state store has exactly one writer, the signaling engine. Everything
//! a UI renders (registration text, call text, toggles, the incoming-call
//! banner) is read from a watch channel; commands travel the other way as
//! messages and are applied in arrival order.

use crate::dialog::Direction;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl RegistrationStatus {
    pub fn text(&self) -> &'static str {
        match self {
            RegistrationStatus::Unregistered => "Not Registered",
            RegistrationStatus::Registering => "Registering",
            RegistrationStatus::Registered => "Registered",
            RegistrationStatus::Failed => "Registration Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Connected,
    Held,
    Ended,
    Rejected,
}

impl CallState {
    /// A live call leg exists in this state.
    pub fn is_in_call(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connected | CallState::Held
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected)
    }
}

/// The one call leg a single-line client ever has.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// SIP Call-ID, doubling as the session id in events.
    pub id: String,
    /// Peer number or user part.
    pub peer: String,
    pub direction: Direction,
    pub state: CallState,
    pub muted: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn outbound(id: String, peer: String) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Outbound,
            state: CallState::Calling,
            muted: false,
            started_at: None,
        }
    }

    pub fn inbound(id: String, peer: String) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Inbound,
            state: CallState::Ringing,
            muted: false,
            started_at: None,
        }
    }

    pub fn connect(&mut self) {
        self.state = CallState::Connected;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn end(&mut self, state: CallState) {
        debug_assert!(state.is_terminal());
        self.state = state;
    }
}

/// Everything a UI observes, published whole on every change.
#[derive(Debug, Clone, Serialize)]
pub struct PhoneState {
    pub registration: RegistrationStatus,
    pub registration_status: String,
    pub call: CallState,
    pub call_status: String,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub is_incoming_call: bool,
    pub incoming_call_number: String,
    pub call_started_at: Option<DateTime<Utc>>,
}

impl Default for PhoneState {
    fn default() -> Self {
        Self {
            registration: RegistrationStatus::Unregistered,
            registration_status: RegistrationStatus::Unregistered.text().to_string(),
            call: CallState::Idle,
            call_status: "Idle".to_string(),
            is_muted: false,
            // The softphone starts with speakerphone routing requested.
            is_speaker_on: true,
            is_incoming_call: false,
            incoming_call_number: String::new(),
            call_started_at: None,
        }
    }
}

impl PhoneState {
    /// Elapsed talk time while a call is connected or held.
    pub fn call_duration(&self) -> Option<chrono::Duration> {
        self.call_started_at.map(|started| Utc::now() - started)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Command {
    PlaceCall { destination: String },
    Answer,
    Reject,
    HangUp,
    Hold,
    Resume,
    ToggleMute,
    ToggleSpeaker,
}

/// Cloneable handle the UI collaborator drives the engine with. Commands
/// are validated against the observed state here, submitted as messages,
/// and re-checked by the engine when they are applied.
#[derive(Clone)]
pub struct CallController {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PhoneState>,
}

impl CallController {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<Command>,
        state_rx: watch::Receiver<PhoneState>,
    ) -> Self {
        Self { cmd_tx, state_rx }
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| Error::State("engine is not running"))
    }

    /// Start an outbound call. Returns as soon as the command is queued;
    /// progress arrives through events and the state store.
    pub fn place_call(&self, destination: &str) -> Result<()> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(Error::InvalidDestination);
        }
        if self.state_rx.borrow().call.is_in_call() {
            return Err(Error::State("a call is already in progress"));
        }
        self.submit(Command::PlaceCall {
            destination: destination.to_string(),
        })
    }

    pub fn answer(&self) -> Result<()> {
        {
            let state = self.state_rx.borrow();
            if state.call != CallState::Ringing || !state.is_incoming_call {
                return Err(Error::State("no ringing incoming call to answer"));
            }
        }
        self.submit(Command::Answer)
    }

    pub fn reject(&self) -> Result<()> {
        if !self.state_rx.borrow().call.is_in_call() {
            return Err(Error::State("no active call to reject"));
        }
        self.submit(Command::Reject)
    }

    pub fn hang_up(&self) -> Result<()> {
        if !self.state_rx.borrow().call.is_in_call() {
            return Err(Error::State("no active call to hang up"));
        }
        self.submit(Command::HangUp)
    }

    pub fn hold(&self) -> Result<()> {
        match self.state_rx.borrow().call {
            CallState::Connected => self.submit(Command::Hold),
            // Already where the caller wants to be.
            CallState::Held => Ok(()),
            _ => Err(Error::State("no connected call to hold")),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.state_rx.borrow().call {
            CallState::Held => self.submit(Command::Resume),
            CallState::Connected => Ok(()),
            _ => Err(Error::State("no held call to resume")),
        }
    }

    /// Local microphone mute; no signaling involved.
    pub fn toggle_mute(&self) -> Result<()> {
        self.submit(Command::ToggleMute)
    }

    /// Speaker routing intent; the platform audio collaborator acts on it.
    pub fn toggle_speaker(&self) -> Result<()> {
        self.submit(Command::ToggleSpeaker)
    }

    pub fn state(&self) -> PhoneState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PhoneState> {
        self.state_rx.clone()
    }
}

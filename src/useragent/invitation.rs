//! Inbound request handling: new INVITEs ring the UI through the event
//! queue (no polling), in-dialog requests are sequence-checked, and the
//! peer's notifications are surfaced — including the duration report some
//! servers use as their end-of-call signal.

use super::useragent::{Engine, Tick};
use crate::call::{CallSession, CallState};
use crate::dialog::{self, Dialog, Direction};
use crate::event::EventKind;
use crate::sdp::{self, MediaDirection};
use crate::transaction::{via_branch, ServerTransaction, TxKey};
use bytes::Bytes;
use rsip::{Header, Method, Request};
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

impl Engine {
    pub(crate) async fn on_request(&mut self, request: Request, source: SocketAddr) {
        let Some(branch) = via_branch(&request.headers) else {
            debug!("request without Via branch, discarded");
            return;
        };

        if request.method == Method::Ack {
            // An ACK for our non-2xx shares the INVITE's branch; an ACK for
            // a 2xx just confirms the exchange either way.
            let invite_key = TxKey::new(branch, &Method::Invite);
            let confirmed = self
                .server_txs
                .get_mut(&invite_key)
                .and_then(|tx| tx.on_ack().map(|delay| (delay, tx.generation)));
            if let Some((delay, generation)) = confirmed {
                self.schedule(
                    delay,
                    Tick::ServerTxCleanup {
                        key: invite_key,
                        generation,
                    },
                );
            }
            return;
        }

        let key = TxKey::new(branch, &request.method);
        let replay = self
            .server_txs
            .get(&key)
            .map(|tx| (tx.retransmission_reply(), tx.source));
        if let Some((reply, tx_source)) = replay {
            // Retransmitted request: repeat our answer, do not reprocess.
            if let Some(wire) = reply {
                self.send_wire(wire, tx_source).await;
            }
            return;
        }

        if dialog::request_has_to_tag(&request) {
            self.in_dialog_request(request, source).await;
            return;
        }

        match request.method {
            Method::Invite => self.new_incoming_call(key, request, source).await,
            Method::Cancel => self.on_cancel(request, source).await,
            Method::Bye => {
                self.reply(&request, source, 481, None, vec![], None).await;
            }
            Method::Options => {
                self.reply(&request, source, 200, None, vec![], None).await;
            }
            _ => {
                let text = String::from_utf8_lossy(&request.body).to_string();
                self.reply(&request, source, 200, None, vec![], None).await;
                self.on_notification_text(text).await;
            }
        }
    }

    /// Answer an inbound request under a server transaction so that
    /// retransmissions replay the same response.
    pub(crate) async fn reply(
        &mut self,
        request: &Request,
        source: SocketAddr,
        status: u16,
        to_tag: Option<&str>,
        extra_headers: Vec<Header>,
        body: Option<(&str, String)>,
    ) {
        let response = dialog::response_for(request, status, to_tag, extra_headers, body);
        let wire = Bytes::from(response.to_string());
        let Some(branch) = via_branch(&request.headers) else {
            return;
        };
        let key = TxKey::new(branch, &request.method);
        let generation = self.next_gen();
        let reliable = self.config.transport.is_reliable();
        let timers = self.timers;
        let linger = match self.server_txs.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let tx = entry.get_mut();
                tx.record_response(status, wire.clone())
                    .map(|delay| (delay, tx.generation))
            }
            Entry::Vacant(entry) => {
                let mut tx = ServerTransaction::new(
                    key.clone(),
                    request.clone(),
                    source,
                    reliable,
                    timers,
                    generation,
                );
                let linger = tx
                    .record_response(status, wire.clone())
                    .map(|delay| (delay, generation));
                entry.insert(tx);
                linger
            }
        };
        if let Some((delay, generation)) = linger {
            self.schedule(delay, Tick::ServerTxCleanup { key, generation });
        }
        self.send_wire(wire, source).await;
    }

    async fn new_incoming_call(&mut self, key: TxKey, request: Request, source: SocketAddr) {
        if self
            .session
            .as_ref()
            .map(|s| s.state.is_in_call())
            .unwrap_or(false)
        {
            info!("busy, refusing second call");
            let tag = dialog::generate_tag();
            self.reply(&request, source, 486, Some(&tag), vec![], None)
                .await;
            return;
        }
        let dialog = match Dialog::new_inbound(&request, source) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!("unusable INVITE from {}: {}", source, e);
                self.reply(&request, source, 400, None, vec![], None).await;
                return;
            }
        };
        let peer = dialog::peer_user(&request).unwrap_or_else(|| "unknown".to_string());
        let local_tag = dialog.local_tag.clone();
        let call_id = dialog.call_id.clone();

        self.reply(&request, source, 180, Some(&local_tag), vec![], None)
            .await;

        self.invite_server = Some(key);
        self.dialog = Some(dialog);
        self.session = Some(CallSession::inbound(call_id, peer.clone()));
        let status = format!("Incoming call from {}", peer);
        self.publish(|s| {
            s.call = CallState::Ringing;
            s.call_status = status.clone();
            s.is_incoming_call = true;
            s.incoming_call_number = peer.clone();
            s.call_started_at = None;
        });
        self.emit(EventKind::IncomingCall, peer.clone());
        info!(peer = %peer, "incoming call ringing");
    }

    /// Accept the ringing INVITE with a 200 and our audio description.
    pub(crate) async fn answer(&mut self) {
        let ringing_inbound = matches!(
            self.session.as_ref(),
            Some(s) if s.state == CallState::Ringing && s.direction == Direction::Inbound
        );
        if !ringing_inbound {
            debug!("answer ignored, nothing is ringing");
            return;
        }
        let Some(key) = self.invite_server.clone() else {
            return;
        };
        let Some((request, source)) = self
            .server_txs
            .get(&key)
            .map(|tx| (tx.request.clone(), tx.source))
        else {
            return;
        };
        let Some(local_tag) = self.dialog.as_ref().map(|d| d.local_tag.clone()) else {
            return;
        };
        let body = sdp::audio_body(
            &self.config.username,
            &self.transport.local_addr().ip().to_string(),
            self.config.rtp_port,
            MediaDirection::SendRecv,
        );
        let contact = self.contact_header();
        self.reply(
            &request,
            source,
            200,
            Some(&local_tag),
            vec![contact],
            Some(("application/sdp", body)),
        )
        .await;
        if let Some(dialog) = self.dialog.as_mut() {
            dialog.confirm_local();
        }
        self.connect_session().await;
    }

    /// Decline the ringing INVITE with 603. Returns false when nothing is
    /// ringing inbound, so callers can fall back to hang-up semantics.
    pub(crate) async fn reject_pending(&mut self) -> bool {
        let ringing_inbound = matches!(
            self.session.as_ref(),
            Some(s) if s.state == CallState::Ringing && s.direction == Direction::Inbound
        );
        if !ringing_inbound {
            return false;
        }
        let Some(key) = self.invite_server.clone() else {
            return false;
        };
        let data = self
            .server_txs
            .get(&key)
            .map(|tx| (tx.request.clone(), tx.source));
        let local_tag = self
            .dialog
            .as_ref()
            .map(|d| d.local_tag.clone())
            .unwrap_or_else(dialog::generate_tag);
        if let Some((request, source)) = data {
            self.reply(&request, source, 603, Some(&local_tag), vec![], None)
                .await;
        }
        if let Some(dialog) = self.dialog.as_mut() {
            dialog.terminate();
        }
        info!("incoming call declined");
        true
    }

    async fn in_dialog_request(&mut self, request: Request, source: SocketAddr) {
        let Some(call_id) = dialog::call_id_value(&request.headers) else {
            debug!("in-dialog request without Call-ID, discarded");
            return;
        };
        let known = self
            .dialog
            .as_ref()
            .map(|d| d.matches(&call_id))
            .unwrap_or(false);
        if !known {
            self.reply(&request, source, 481, None, vec![], None).await;
            return;
        }
        let in_order = self
            .dialog
            .as_mut()
            .map(|d| d.validate_inbound(&request))
            .unwrap_or(false);
        if !in_order {
            // Out-of-order or replayed CSeq: refused, never applied.
            warn!("out-of-order in-dialog request refused");
            self.reply(&request, source, 500, None, vec![], None).await;
            return;
        }

        match request.method {
            Method::Bye => {
                self.reply(&request, source, 200, None, vec![], None).await;
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.terminate();
                }
                let active = self
                    .session
                    .as_ref()
                    .map(|s| s.state.is_in_call())
                    .unwrap_or(false);
                if active {
                    self.end_call(CallState::Ended, "Call Ended");
                    self.emit(EventKind::CallTerminated, "peer hung up");
                    info!("peer hung up");
                }
            }
            Method::Invite => {
                // Peer-initiated re-INVITE (hold/resume or refresh); media
                // details are the audio collaborator's concern, we accept.
                let local_tag = self
                    .dialog
                    .as_ref()
                    .map(|d| d.local_tag.clone())
                    .unwrap_or_else(dialog::generate_tag);
                let body = sdp::audio_body(
                    &self.config.username,
                    &self.transport.local_addr().ip().to_string(),
                    self.config.rtp_port,
                    MediaDirection::SendRecv,
                );
                let contact = self.contact_header();
                self.reply(
                    &request,
                    source,
                    200,
                    Some(&local_tag),
                    vec![contact],
                    Some(("application/sdp", body)),
                )
                .await;
            }
            Method::Info | Method::Message | Method::Notify | Method::Update => {
                let text = String::from_utf8_lossy(&request.body).to_string();
                self.reply(&request, source, 200, None, vec![], None).await;
                self.on_notification_text(text).await;
            }
            Method::Ack => {}
            _ => {
                self.reply(&request, source, 200, None, vec![], None).await;
            }
        }
    }

    async fn on_cancel(&mut self, request: Request, source: SocketAddr) {
        self.reply(&request, source, 200, None, vec![], None).await;
        let ringing_inbound = matches!(
            self.session.as_ref(),
            Some(s) if s.state == CallState::Ringing && s.direction == Direction::Inbound
        );
        if !ringing_inbound {
            return;
        }
        let Some(branch) = via_branch(&request.headers) else {
            return;
        };
        let invite_key = TxKey::new(branch, &Method::Invite);
        if self.invite_server.as_ref() != Some(&invite_key) {
            debug!("CANCEL for an unknown INVITE, ignored");
            return;
        }
        let data = self
            .server_txs
            .get(&invite_key)
            .map(|tx| (tx.request.clone(), tx.source));
        let local_tag = self
            .dialog
            .as_ref()
            .map(|d| d.local_tag.clone())
            .unwrap_or_else(dialog::generate_tag);
        if let Some((invite_request, tx_source)) = data {
            self.reply(&invite_request, tx_source, 487, Some(&local_tag), vec![], None)
                .await;
        }
        if let Some(dialog) = self.dialog.as_mut() {
            dialog.terminate();
        }
        self.end_call(CallState::Ended, "Call Ended");
        self.emit(EventKind::CallTerminated, "cancelled by peer");
        info!("incoming call cancelled by peer");
    }

    /// Peer notification text. The deployed server ends calls by sending a
    /// duration report, so that exact text drives the reject path; other
    /// notifications are only surfaced.
    pub(crate) async fn on_notification_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        self.emit(EventKind::Notification, text.clone());
        if !text.contains("Call duration:") {
            return;
        }
        let active = self
            .session
            .as_ref()
            .map(|s| s.state.is_in_call())
            .unwrap_or(false);
        if active {
            info!("duration report received, ending call");
            self.emit(EventKind::CallEndedByDurationReport, text);
            self.terminate_call().await;
            self.end_call(CallState::Rejected, "Call Rejected");
        }
    }
}

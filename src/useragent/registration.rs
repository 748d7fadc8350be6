//! REGISTER lifecycle: initial binding, refresh before expiry, digest
//! challenges, and backoff when the registrar is unreachable. Registration
//! trouble is reported through events and the state store, never fatal.

use super::useragent::{Engine, Tick};
use crate::auth;
use crate::call::RegistrationStatus;
use crate::event::EventKind;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How far ahead of expiry the refresh goes out.
const REFRESH_LEAD: u64 = 5;

impl Engine {
    fn aor(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.domain())
    }

    fn registrar_uri(&self) -> String {
        format!("sip:{}", self.config.domain())
    }

    fn set_registration(&mut self, status: RegistrationStatus) {
        if self.registration.status == status {
            return;
        }
        self.registration.status = status;
        self.publish(|s| {
            s.registration = status;
            s.registration_status = status.text().to_string();
        });
    }

    pub(crate) async fn start_registration(&mut self) {
        info!(aor = %self.aor(), "starting registration");
        self.set_registration(RegistrationStatus::Registering);
        self.emit(EventKind::RegistrationChanged, "registering");
        self.send_register(None).await;
    }

    fn build_register(&mut self, expires: u32, authorization: Option<Header>) -> Option<Request> {
        self.registration.cseq += 1;
        let aor = self.aor();
        let mut headers = Headers::default();
        headers.push(Header::MaxForwards("70".into()));
        headers.push(Header::From(
            format!("<{}>;tag={}", aor, self.registration.from_tag).into(),
        ));
        headers.push(Header::To(format!("<{}>", aor).into()));
        headers.push(Header::CallId(self.registration.call_id.clone().into()));
        headers.push(Header::CSeq(
            format!("{} REGISTER", self.registration.cseq).into(),
        ));
        headers.push(Header::Expires(expires.to_string().into()));
        if let Some(header) = authorization {
            headers.push(header);
        }
        let uri = match rsip::Uri::try_from(self.registrar_uri()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("bad registrar uri: {}", e);
                return None;
            }
        };
        Some(Request {
            method: Method::Register,
            uri,
            headers,
            version: rsip::Version::V2,
            body: Vec::new(),
        })
    }

    pub(crate) async fn send_register(&mut self, authorization: Option<Header>) {
        let expires = self.config.register_expires;
        let Some(request) = self.build_register(expires, authorization) else {
            return;
        };
        if let Err(e) = self.send_request(request, self.server_addr).await {
            warn!("REGISTER send failed: {}", e);
            self.on_register_failure(format!("network error: {}", e))
                .await;
        }
    }

    pub(crate) async fn on_register_response(&mut self, status: u16, response: &Response) {
        match status {
            200..=299 => {
                self.registration.auth_failures = 0;
                self.registration.backoff =
                    Duration::from_secs(self.config.register_retry_base_secs.max(1));
                self.registration.failure_reported = false;
                self.set_registration(RegistrationStatus::Registered);
                self.emit(EventKind::RegistrationChanged, "registered");

                let expires = response
                    .headers
                    .iter()
                    .find_map(|h| match h {
                        Header::Expires(e) => e.value().trim().parse::<u64>().ok(),
                        _ => None,
                    })
                    .unwrap_or(self.config.register_expires as u64);
                let refresh = expires.saturating_sub(REFRESH_LEAD).max(1);
                self.registration.generation += 1;
                let generation = self.registration.generation;
                info!(expires, refresh, "registered, refresh scheduled");
                self.schedule(
                    Duration::from_secs(refresh),
                    Tick::RegisterRefresh { generation },
                );
            }
            401 | 407 => {
                self.registration.auth_failures += 1;
                if self.registration.auth_failures >= self.config.max_auth_failures {
                    warn!(
                        failures = self.registration.auth_failures,
                        "registration challenges exhausted"
                    );
                    self.set_registration(RegistrationStatus::Failed);
                    self.emit(
                        EventKind::RegistrationFailed,
                        "authentication failed: challenge limit reached",
                    );
                    return;
                }
                let Some((challenge, proxy)) = Self::challenge_from(response) else {
                    self.set_registration(RegistrationStatus::Failed);
                    self.emit(
                        EventKind::RegistrationFailed,
                        "challenge without digest parameters",
                    );
                    return;
                };
                debug!(realm = %challenge.realm, "answering registration challenge");
                let value = auth::authorization(
                    &self.config.credential(),
                    &challenge,
                    "REGISTER",
                    &self.registrar_uri(),
                );
                let header = if proxy {
                    Header::ProxyAuthorization(value.into())
                } else {
                    Header::Authorization(value.into())
                };
                self.send_register(Some(header)).await;
            }
            _ => {
                self.on_register_failure(format!("registrar answered {}", status))
                    .await;
            }
        }
    }

    /// Network-level or server-side failure: retry with doubling backoff.
    /// Failed is reported once the backoff reaches its ceiling, but retries
    /// keep going; losing the registrar must never stop the engine.
    pub(crate) async fn on_register_failure(&mut self, detail: String) {
        let ceiling = Duration::from_secs(self.config.register_retry_ceiling_secs.max(1));
        let backoff = self.registration.backoff;
        warn!(retry_in = ?backoff, "registration failed: {}", detail);

        self.registration.generation += 1;
        let generation = self.registration.generation;
        self.schedule(backoff, Tick::RegisterRetry { generation });

        let next = std::cmp::min(backoff * 2, ceiling);
        if next >= ceiling && !self.registration.failure_reported {
            self.registration.failure_reported = true;
            self.set_registration(RegistrationStatus::Failed);
            self.emit(EventKind::RegistrationFailed, detail);
        }
        self.registration.backoff = next;
    }

    /// Drop the binding on shutdown, fire-and-forget.
    pub(crate) async fn unregister(&mut self) {
        if let Some(request) = self.build_register(0, None) {
            info!(aor = %self.aor(), "unregistering");
            self.send_plain(request, self.server_addr).await;
        }
        self.set_registration(RegistrationStatus::Unregistered);
    }
}

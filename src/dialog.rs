//! INVITE dialog state (RFC 3261 section 12).
//!
//! A dialog owns the Call-ID, the two tags, and both sequence number
//! directions. It builds in-dialog requests and the responses that answer
//! the peer's. The engine adds Via, Contact and the other hop-by-hop
//! headers just before a request hits the wire.

use crate::error::{Error, Result};
use crate::transaction::cseq_parts;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response};
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// First header of the wanted shape, as its raw value.
fn header_value(headers: &Headers, want: fn(&Header) -> Option<&str>) -> Option<String> {
    headers.iter().find_map(|h| want(h).map(|v| v.to_string()))
}

fn from_value(headers: &Headers) -> Option<String> {
    header_value(headers, |h| match h {
        Header::From(v) => Some(v.value()),
        _ => None,
    })
}

fn to_value(headers: &Headers) -> Option<String> {
    header_value(headers, |h| match h {
        Header::To(v) => Some(v.value()),
        _ => None,
    })
}

pub fn call_id_value(headers: &Headers) -> Option<String> {
    header_value(headers, |h| match h {
        Header::CallId(v) => Some(v.value()),
        _ => None,
    })
}

fn contact_value(headers: &Headers) -> Option<String> {
    header_value(headers, |h| match h {
        Header::Contact(v) => Some(v.value()),
        _ => None,
    })
}

/// `tag` parameter out of a From/To value.
pub fn extract_tag(value: &str) -> Option<String> {
    let idx = value.find("tag=")?;
    let rest = &value[idx + 4..];
    let end = rest
        .find(|c| c == ';' || c == '>' || c == ' ' || c == ',')
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(rest[..end].to_string())
    }
}

/// URI inside the angle brackets of a Contact/From/To value.
pub fn extract_uri(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if close > open => value[open + 1..close].to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// Whether the request's To header already carries a tag, i.e. the request
/// belongs to an established dialog.
pub fn request_has_to_tag(request: &Request) -> bool {
    to_value(&request.headers)
        .and_then(|v| extract_tag(&v))
        .is_some()
}

/// The calling user, read from the From header.
pub fn peer_user(request: &Request) -> Option<String> {
    from_value(&request.headers).and_then(|v| uri_user(&v))
}

/// User part of the first SIP URI in a header value.
pub fn uri_user(value: &str) -> Option<String> {
    let idx = value.find("sip:")?;
    let rest = &value[idx + 4..];
    let at = rest.find('@')?;
    let user = &rest[..at];
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
    pub local_uri: String,
    pub remote_uri: String,
    /// Where in-dialog requests are addressed (the peer's Contact once
    /// known, the original URI before that).
    pub remote_target: String,
    pub route_set: Vec<String>,
    /// Network peer for this leg: the proxy for outbound calls, the
    /// request source for inbound ones.
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub state: DialogState,
}

impl Dialog {
    pub fn new_outbound(local_uri: String, remote_uri: String, remote_addr: SocketAddr) -> Self {
        Self {
            call_id: format!("{}", Uuid::new_v4()),
            local_tag: generate_tag(),
            remote_tag: None,
            local_seq: 1,
            remote_seq: None,
            remote_target: remote_uri.clone(),
            local_uri,
            remote_uri,
            route_set: Vec::new(),
            remote_addr,
            direction: Direction::Outbound,
            state: DialogState::Early,
        }
    }

    /// Dialog for an incoming INVITE; we are the UAS leg.
    pub fn new_inbound(request: &Request, source: SocketAddr) -> Result<Self> {
        let call_id = call_id_value(&request.headers)
            .ok_or_else(|| Error::Protocol("INVITE without Call-ID".to_string()))?;
        let from = from_value(&request.headers)
            .ok_or_else(|| Error::Protocol("INVITE without From".to_string()))?;
        let to = to_value(&request.headers)
            .ok_or_else(|| Error::Protocol("INVITE without To".to_string()))?;
        let remote_tag = extract_tag(&from);
        let remote_seq = cseq_parts(&request.headers).map(|(seq, _)| seq);
        let remote_target = contact_value(&request.headers)
            .map(|c| extract_uri(&c))
            .unwrap_or_else(|| extract_uri(&from));
        Ok(Self {
            call_id,
            local_tag: generate_tag(),
            remote_tag,
            local_seq: 1,
            remote_seq,
            local_uri: extract_uri(&to),
            remote_uri: extract_uri(&from),
            remote_target,
            route_set: Vec::new(),
            remote_addr: source,
            direction: Direction::Inbound,
            state: DialogState::Early,
        })
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.local_seq;
        self.local_seq += 1;
        seq
    }

    fn from_header(&self) -> Header {
        Header::From(format!("<{}>;tag={}", self.local_uri, self.local_tag).into())
    }

    fn to_header(&self) -> Header {
        match &self.remote_tag {
            Some(tag) => Header::To(format!("<{}>;tag={}", self.remote_uri, tag).into()),
            None => Header::To(format!("<{}>", self.remote_uri).into()),
        }
    }

    fn base_headers(&self, seq: u32, method: Method) -> Headers {
        let mut headers = Headers::default();
        headers.push(Header::MaxForwards("70".into()));
        headers.push(self.from_header());
        headers.push(self.to_header());
        headers.push(Header::CallId(self.call_id.clone().into()));
        headers.push(Header::CSeq(format!("{} {}", seq, method).into()));
        for route in &self.route_set {
            headers.push(Header::Route(route.clone().into()));
        }
        headers
    }

    fn target_uri(&self) -> Result<rsip::Uri> {
        rsip::Uri::try_from(self.remote_target.clone())
            .map_err(|e| Error::Protocol(format!("bad remote target: {}", e)))
    }

    /// Build an in-dialog (or dialog-forming INVITE) request. The sequence
    /// number advances; ACK is built separately because it reuses one.
    pub fn request(&mut self, method: Method) -> Result<Request> {
        let seq = self.next_seq();
        let headers = self.base_headers(seq, method.clone());
        Ok(Request {
            method,
            uri: self.target_uri()?,
            headers,
            version: rsip::Version::V2,
            body: Vec::new(),
        })
    }

    /// ACK for a 2xx response; carries the INVITE's sequence number.
    pub fn ack(&self, invite_seq: u32) -> Result<Request> {
        let headers = self.base_headers(invite_seq, Method::Ack);
        Ok(Request {
            method: Method::Ack,
            uri: self.target_uri()?,
            headers,
            version: rsip::Version::V2,
            body: Vec::new(),
        })
    }

    /// Record the peer tag carried by a provisional response.
    pub fn on_provisional(&mut self, response: &Response) {
        if self.remote_tag.is_none() {
            if let Some(to) = to_value(&response.headers) {
                self.remote_tag = extract_tag(&to);
            }
        }
    }

    /// A 2xx to our INVITE confirms the dialog: remote tag, remote target
    /// and route set are locked in.
    pub fn confirm(&mut self, response: &Response) {
        if let Some(to) = to_value(&response.headers) {
            if let Some(tag) = extract_tag(&to) {
                self.remote_tag = Some(tag);
            }
        }
        if let Some(contact) = contact_value(&response.headers) {
            self.remote_target = extract_uri(&contact);
        }
        // Record-Route headers, reversed, form the route set for the UAC.
        let mut routes: Vec<String> = response
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(v) => Some(v.value().to_string()),
                _ => None,
            })
            .collect();
        routes.reverse();
        self.route_set = routes;
        self.state = DialogState::Confirmed;
    }

    /// Confirm the UAS leg once our 2xx is sent.
    pub fn confirm_local(&mut self) {
        self.state = DialogState::Confirmed;
    }

    /// In-dialog requests must arrive in CSeq order; duplicates and stale
    /// retransmissions are refused here rather than applied twice. ACK is
    /// exempt, it shares the INVITE's number.
    pub fn validate_inbound(&mut self, request: &Request) -> bool {
        let Some((seq, method)) = cseq_parts(&request.headers) else {
            return false;
        };
        if method == "ACK" {
            return true;
        }
        if let Some(last) = self.remote_seq {
            if seq <= last {
                return false;
            }
        }
        self.remote_seq = Some(seq);
        true
    }

    pub fn matches(&self, call_id: &str) -> bool {
        self.call_id == call_id && self.state != DialogState::Terminated
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }
}

/// CANCEL for a pending INVITE: same URI, Via (with its branch), From, To,
/// Call-ID and sequence number, per RFC 3261 section 9.1.
pub fn cancel_for(invite: &Request) -> Request {
    let mut headers = Headers::default();
    for header in invite.headers.iter() {
        match header {
            Header::Via(_)
            | Header::From(_)
            | Header::To(_)
            | Header::CallId(_)
            | Header::MaxForwards(_)
            | Header::Route(_) => headers.push(header.clone()),
            Header::CSeq(cseq) => {
                let seq = cseq
                    .value()
                    .split_whitespace()
                    .next()
                    .unwrap_or("1")
                    .to_string();
                headers.push(Header::CSeq(format!("{} CANCEL", seq).into()));
            }
            _ => {}
        }
    }
    Request {
        method: Method::Cancel,
        uri: invite.uri.clone(),
        headers,
        version: rsip::Version::V2,
        body: Vec::new(),
    }
}

/// ACK for a non-2xx final response, built at the transaction layer from
/// the original INVITE and the response's To header (RFC 3261 17.1.1.3).
pub fn ack_for_failure(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::default();
    for header in invite.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::MaxForwards(_)
            | Header::Route(_) => headers.push(header.clone()),
            Header::CSeq(cseq) => {
                let seq = cseq
                    .value()
                    .split_whitespace()
                    .next()
                    .unwrap_or("1")
                    .to_string();
                headers.push(Header::CSeq(format!("{} ACK", seq).into()));
            }
            _ => {}
        }
    }
    match to_value(&response.headers) {
        Some(to) => headers.push(Header::To(to.into())),
        None => {
            if let Some(to) = to_value(&invite.headers) {
                headers.push(Header::To(to.into()));
            }
        }
    }
    Request {
        method: Method::Ack,
        uri: invite.uri.clone(),
        headers,
        version: rsip::Version::V2,
        body: Vec::new(),
    }
}

/// Response to an inbound request, mirroring the headers RFC 3261 section
/// 8.2.6 requires. `to_tag` is appended when the request's To carries none.
pub fn response_for(
    request: &Request,
    status: u16,
    to_tag: Option<&str>,
    extra_headers: Vec<Header>,
    body: Option<(&str, String)>,
) -> Response {
    let mut headers = Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_)
            | Header::RecordRoute(_) => headers.push(header.clone()),
            Header::To(to) => {
                let value = to.value();
                if value.contains("tag=") {
                    headers.push(Header::To(value.to_string().into()));
                } else {
                    match to_tag {
                        Some(tag) => {
                            headers.push(Header::To(format!("{};tag={}", value, tag).into()))
                        }
                        None => headers.push(Header::To(value.to_string().into())),
                    }
                }
            }
            _ => {}
        }
    }
    for header in extra_headers {
        headers.push(header);
    }
    let body_bytes = match body {
        Some((content_type, content)) => {
            headers.push(Header::ContentType(content_type.to_string().into()));
            content.into_bytes()
        }
        None => Vec::new(),
    };
    headers.push(Header::ContentLength(body_bytes.len().to_string().into()));
    Response {
        status_code: rsip::StatusCode::from(status),
        headers,
        version: rsip::Version::V2,
        body: body_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5060)
    }

    fn invite_request() -> Request {
        let raw = "INVITE sip:8181@192.168.1.42 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKtest1\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:9001@192.168.1.42>;tag=remote9001\r\n\
             To: <sip:8181@192.168.1.42>\r\n\
             Call-ID: inbound-call-1\r\n\
             CSeq: 10 INVITE\r\n\
             Contact: <sip:9001@10.0.0.5:5060>\r\n\
             Content-Length: 0\r\n\r\n";
        Request::try_from(raw.as_bytes()).unwrap()
    }

    #[test]
    fn tag_and_uri_helpers() {
        assert_eq!(
            extract_tag("<sip:a@b>;tag=abc123;x=1").as_deref(),
            Some("abc123")
        );
        assert_eq!(extract_tag("<sip:a@b>"), None);
        assert_eq!(extract_uri("\"Bob\" <sip:9001@host>;tag=x"), "sip:9001@host");
        assert_eq!(extract_uri("sip:9001@host"), "sip:9001@host");
        assert_eq!(uri_user("<sip:9001@host>").as_deref(), Some("9001"));
        assert_eq!(uri_user("garbage"), None);
    }

    #[test]
    fn outbound_requests_advance_cseq() {
        let mut dialog = Dialog::new_outbound(
            "sip:8181@192.168.1.42".to_string(),
            "sip:9001@192.168.1.42".to_string(),
            addr(),
        );
        let invite = dialog.request(Method::Invite).unwrap();
        assert_eq!(cseq_parts(&invite.headers), Some((1, "INVITE".to_string())));
        let from = from_value(&invite.headers).unwrap();
        assert!(from.contains("tag="));
        let to = to_value(&invite.headers).unwrap();
        assert!(!to.contains("tag="));

        dialog.remote_tag = Some("peer".to_string());
        let bye = dialog.request(Method::Bye).unwrap();
        assert_eq!(cseq_parts(&bye.headers), Some((2, "BYE".to_string())));
        assert!(to_value(&bye.headers).unwrap().contains("tag=peer"));
    }

    #[test]
    fn confirm_takes_tag_contact_and_routes() {
        let mut dialog = Dialog::new_outbound(
            "sip:8181@example.com".to_string(),
            "sip:9001@example.com".to_string(),
            addr(),
        );
        let raw = "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc\r\n\
             From: <sip:8181@example.com>;tag=local\r\n\
             To: <sip:9001@example.com>;tag=answered\r\n\
             Call-ID: x\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:9001@10.0.0.9:5080>\r\n\
             Record-Route: <sip:p2.example.com;lr>\r\n\
             Record-Route: <sip:p1.example.com;lr>\r\n\
             Content-Length: 0\r\n\r\n";
        let response = Response::try_from(raw.as_bytes()).unwrap();
        dialog.confirm(&response);
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.remote_tag.as_deref(), Some("answered"));
        assert_eq!(dialog.remote_target, "sip:9001@10.0.0.9:5080");
        assert_eq!(
            dialog.route_set,
            vec![
                "<sip:p1.example.com;lr>".to_string(),
                "<sip:p2.example.com;lr>".to_string()
            ]
        );
    }

    #[test]
    fn inbound_dialog_from_invite() {
        let dialog = Dialog::new_inbound(&invite_request(), addr()).unwrap();
        assert_eq!(dialog.call_id, "inbound-call-1");
        assert_eq!(dialog.remote_tag.as_deref(), Some("remote9001"));
        assert_eq!(dialog.remote_seq, Some(10));
        assert_eq!(dialog.remote_target, "sip:9001@10.0.0.5:5060");
        assert_eq!(dialog.direction, Direction::Inbound);
    }

    #[test]
    fn out_of_order_cseq_is_refused() {
        let mut dialog = Dialog::new_inbound(&invite_request(), addr()).unwrap();
        let raw = "BYE sip:8181@192.168.1.42 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKtest2\r\n\
             From: <sip:9001@192.168.1.42>;tag=remote9001\r\n\
             To: <sip:8181@192.168.1.42>;tag=local\r\n\
             Call-ID: inbound-call-1\r\n\
             CSeq: 9 BYE\r\n\
             Content-Length: 0\r\n\r\n";
        let stale = Request::try_from(raw.as_bytes()).unwrap();
        assert!(!dialog.validate_inbound(&stale));
        // Unchanged by the refused request.
        assert_eq!(dialog.remote_seq, Some(10));

        let raw_ok = raw.replace("CSeq: 9 BYE", "CSeq: 11 BYE");
        let fresh = Request::try_from(raw_ok.as_bytes()).unwrap();
        assert!(dialog.validate_inbound(&fresh));
        assert_eq!(dialog.remote_seq, Some(11));
    }

    #[test]
    fn cancel_mirrors_invite_identity() {
        let mut dialog = Dialog::new_outbound(
            "sip:8181@example.com".to_string(),
            "sip:9001@example.com".to_string(),
            addr(),
        );
        let mut invite = dialog.request(Method::Invite).unwrap();
        invite.headers.push(Header::Via(
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv".into(),
        ));
        let cancel = cancel_for(&invite);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(
            crate::transaction::via_branch(&cancel.headers).as_deref(),
            Some("z9hG4bKinv")
        );
        assert_eq!(cseq_parts(&cancel.headers), Some((1, "CANCEL".to_string())));
        assert_eq!(
            call_id_value(&cancel.headers),
            call_id_value(&invite.headers)
        );
    }

    #[test]
    fn failure_ack_takes_response_to() {
        let mut dialog = Dialog::new_outbound(
            "sip:8181@example.com".to_string(),
            "sip:9001@example.com".to_string(),
            addr(),
        );
        let mut invite = dialog.request(Method::Invite).unwrap();
        invite.headers.push(Header::Via(
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv".into(),
        ));
        let raw = "SIP/2.0 486 Busy Here\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinv\r\n\
             From: <sip:8181@example.com>;tag=local\r\n\
             To: <sip:9001@example.com>;tag=busy486\r\n\
             Call-ID: y\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n";
        let response = Response::try_from(raw.as_bytes()).unwrap();
        let ack = ack_for_failure(&invite, &response);
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(cseq_parts(&ack.headers), Some((1, "ACK".to_string())));
        assert!(to_value(&ack.headers).unwrap().contains("tag=busy486"));
    }

    #[test]
    fn response_copies_identity_and_adds_tag() {
        let request = invite_request();
        let response = response_for(
            &request,
            180,
            Some("localtag"),
            vec![],
            None,
        );
        assert_eq!(u16::from(response.status_code.clone()), 180);
        assert!(to_value(&response.headers).unwrap().contains("tag=localtag"));
        assert_eq!(
            call_id_value(&response.headers).as_deref(),
            Some("inbound-call-1")
        );
        assert_eq!(cseq_parts(&response.headers), Some((10, "INVITE".to_string())));
        // Body version carries type and length.
        let with_body = response_for(
            &request,
            200,
            Some("localtag"),
            vec![],
            Some(("application/sdp", "v=0\r\n".to_string())),
        );
        assert_eq!(with_body.body, b"v=0\r\n".to_vec());
    }
}

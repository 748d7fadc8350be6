use super::{spawn_ua, test_config, wait_for_state};
use crate::auth;
use crate::call::RegistrationStatus;
use crate::dialog;
use crate::event::EventKind;
use rsip::{Header, Method, Request};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

async fn recv_register(registrar: &UdpSocket, buf: &mut [u8]) -> Option<(Request, SocketAddr)> {
    loop {
        let (n, source) = timeout(Duration::from_secs(3), registrar.recv_from(buf))
            .await
            .ok()?
            .ok()?;
        if let Ok(request) = Request::try_from(&buf[..n]) {
            if request.method == Method::Register {
                return Some((request, source));
            }
        }
    }
}

async fn respond(
    registrar: &UdpSocket,
    request: &Request,
    source: SocketAddr,
    status: u16,
    extra: Vec<Header>,
) {
    let response = dialog::response_for(request, status, Some("reg"), extra, None);
    registrar
        .send_to(response.to_string().as_bytes(), source)
        .await
        .unwrap();
}

fn registrar_config(registrar: &UdpSocket, expires: u32) -> crate::config::Config {
    let mut config = test_config("8181", &registrar.local_addr().unwrap().to_string());
    config.register = true;
    config.register_expires = expires;
    config
}

#[tokio::test]
async fn registers_and_refreshes_before_expiry() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Expiry of six seconds puts the refresh one second in.
    let ua = spawn_ua(registrar_config(&registrar, 6)).await;
    let ctl = ua.controller();

    let mut buf = [0u8; 4096];
    let mut register_count = 0u32;
    let deadline = Instant::now() + Duration::from_secs(4);
    while register_count < 2 && Instant::now() < deadline {
        let Some((request, source)) = recv_register(&registrar, &mut buf).await else {
            break;
        };
        register_count += 1;
        respond(
            &registrar,
            &request,
            source,
            200,
            vec![Header::Expires("6".into())],
        )
        .await;
    }

    assert!(register_count >= 2, "refresh REGISTER never arrived");
    wait_for_state(&ctl, "registered", |s| {
        s.registration == RegistrationStatus::Registered
    })
    .await;
    assert_eq!(ctl.state().registration_status, "Registered");
    ua.stop();
}

fn digest_params(value: &str) -> HashMap<String, String> {
    value
        .trim_start_matches("Digest ")
        .split(',')
        .filter_map(|part| {
            part.trim()
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[tokio::test]
async fn answers_digest_challenge_with_valid_credentials() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ua = spawn_ua(registrar_config(&registrar, 60)).await;
    let ctl = ua.controller();

    let mut buf = [0u8; 4096];
    let (first, source) = recv_register(&registrar, &mut buf).await.unwrap();
    let has_auth = first
        .headers
        .iter()
        .any(|h| matches!(h, Header::Authorization(_)));
    assert!(!has_auth, "initial REGISTER must not guess credentials");
    respond(
        &registrar,
        &first,
        source,
        401,
        vec![Header::WwwAuthenticate(
            r#"Digest realm="rustphone.test", nonce="1bcf5802aa", algorithm=MD5, qop="auth""#
                .into(),
        )],
    )
    .await;

    let (second, source) = recv_register(&registrar, &mut buf).await.unwrap();
    let authorization = second
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Authorization(v) => {
                use rsip::headers::UntypedHeader;
                Some(v.value().to_string())
            }
            _ => None,
        })
        .expect("challenged REGISTER carries Authorization");
    let params = digest_params(&authorization);
    assert_eq!(params["username"], "8181");
    assert_eq!(params["realm"], "rustphone.test");
    assert_eq!(params["nonce"], "1bcf5802aa");
    let expected = auth::digest_response(
        "8181",
        "secret",
        "rustphone.test",
        "1bcf5802aa",
        "REGISTER",
        &params["uri"],
        Some("auth"),
        Some(&params["nc"]),
        Some(&params["cnonce"]),
    );
    assert_eq!(params["response"], expected);

    respond(
        &registrar,
        &second,
        source,
        200,
        vec![Header::Expires("60".into())],
    )
    .await;
    wait_for_state(&ctl, "registered", |s| {
        s.registration == RegistrationStatus::Registered
    })
    .await;
    ua.stop();
}

#[tokio::test]
async fn unreachable_registrar_reports_failed_but_keeps_retrying() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = registrar_config(&registrar, 60);
    config.register_retry_base_secs = 1;
    config.register_retry_ceiling_secs = 1;
    let ua = spawn_ua(config).await;
    let ctl = ua.controller();
    let mut events = ua.take_events().unwrap();

    let mut buf = [0u8; 4096];
    let (request, source) = recv_register(&registrar, &mut buf).await.unwrap();
    respond(&registrar, &request, source, 503, vec![]).await;

    wait_for_state(&ctl, "registration failed", |s| {
        s.registration == RegistrationStatus::Failed
    })
    .await;
    assert_eq!(ctl.state().registration_status, "Registration Failed");
    let failed = timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await;
            if event.kind == EventKind::RegistrationFailed {
                return event;
            }
        }
    })
    .await
    .expect("failure event");
    assert!(failed.detail.contains("503"));

    // Failure is a report, not a stop: the retry still shows up.
    let retry = recv_register(&registrar, &mut buf).await;
    assert!(retry.is_some(), "no retry after failure report");
    ua.stop();
}

#[tokio::test]
async fn exhausted_challenges_mark_the_account_failed() {
    let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ua = spawn_ua(registrar_config(&registrar, 60)).await;
    let ctl = ua.controller();

    let challenge = Header::WwwAuthenticate(
        r#"Digest realm="rustphone.test", nonce="deadbeef01", algorithm=MD5"#.into(),
    );
    let mut buf = [0u8; 4096];
    let mut challenged = 0u32;
    // Default limit is three consecutive challenges.
    for _ in 0..3 {
        let Some((request, source)) = recv_register(&registrar, &mut buf).await else {
            break;
        };
        challenged += 1;
        respond(&registrar, &request, source, 401, vec![challenge.clone()]).await;
    }
    assert_eq!(challenged, 3);

    wait_for_state(&ctl, "auth failed", |s| {
        s.registration == RegistrationStatus::Failed
    })
    .await;
    ua.stop();
}

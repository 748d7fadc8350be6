//! Client-side SIP digest authentication (RFC 2617, RFC 3261).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Account credentials used to answer 401/407 challenges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Result<Self> {
        let params = parse_digest_params(value);
        Ok(Self {
            realm: params
                .get("realm")
                .cloned()
                .ok_or_else(|| Error::Auth("missing realm in challenge".to_string()))?,
            nonce: params
                .get("nonce")
                .cloned()
                .ok_or_else(|| Error::Auth("missing nonce in challenge".to_string()))?,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
        })
    }

    fn wants_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim() == "auth"))
            .unwrap_or(false)
    }
}

/// Parse `key="value"` pairs out of a Digest header value.
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let digest_str = value.strip_prefix("Digest ").unwrap_or(value).trim();
    let mut params = HashMap::new();
    for part in digest_str.split(',') {
        if let Some((key, val)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_string(),
                val.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// MD5 digest response per RFC 2617. `qop`, `nc` and `cnonce` are used
/// together or not at all.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };
    if let Some(qop_value) = qop {
        let nc_value = nc.unwrap_or("00000001");
        let cnonce_value = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc_value, cnonce_value, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

/// Build the `Authorization` header value answering `challenge` for the
/// given request method and request URI.
pub fn authorization(
    credential: &Credential,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
) -> String {
    let realm = credential
        .realm
        .clone()
        .unwrap_or_else(|| challenge.realm.clone());
    if challenge.wants_qop_auth() {
        let cnonce = format!("{:08x}", rand::random::<u32>());
        let nc = "00000001";
        let response = digest_response(
            &credential.username,
            &credential.password,
            &realm,
            &challenge.nonce,
            method,
            uri,
            Some("auth"),
            Some(nc),
            Some(&cnonce),
        );
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5, qop=auth, nc={}, cnonce="{}""#,
            credential.username, realm, challenge.nonce, uri, response, nc, cnonce
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    } else {
        let response = digest_response(
            &credential.username,
            &credential.password,
            &realm,
            &challenge.nonce,
            method,
            uri,
            None,
            None,
            None,
        );
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            credential.username, realm, challenge.nonce, uri, response
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_challenge() {
        let value = r#"Digest realm="sip.example.com", nonce="abc123", algorithm=MD5, qop="auth""#;
        let challenge = DigestChallenge::parse(value).unwrap();
        assert_eq!(challenge.realm, "sip.example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert!(challenge.wants_qop_auth());
    }

    #[test]
    fn parse_challenge_without_qop() {
        let value = r#"Digest realm="r", nonce="n""#;
        let challenge = DigestChallenge::parse(value).unwrap();
        assert!(!challenge.wants_qop_auth());
        assert!(challenge.opaque.is_none());
    }

    #[test]
    fn rfc2617_reference_vector() {
        // The worked example from RFC 2617 section 3.5.
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn response_is_deterministic_and_credential_sensitive() {
        let a = digest_response(
            "8181", "secret", "pbx", "nonce1", "REGISTER", "sip:pbx", None, None, None,
        );
        let b = digest_response(
            "8181", "secret", "pbx", "nonce1", "REGISTER", "sip:pbx", None, None, None,
        );
        let c = digest_response(
            "8181", "other", "pbx", "nonce1", "REGISTER", "sip:pbx", None, None, None,
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn authorization_carries_challenge_fields() {
        let credential = Credential {
            username: "8181".to_string(),
            password: "secret".to_string(),
            realm: None,
        };
        let challenge = DigestChallenge::parse(
            r#"Digest realm="pbx", nonce="xyz", opaque="op", qop="auth""#,
        )
        .unwrap();
        let value = authorization(&credential, &challenge, "REGISTER", "sip:pbx");
        assert!(value.starts_with("Digest username=\"8181\""));
        assert!(value.contains("realm=\"pbx\""));
        assert!(value.contains("nonce=\"xyz\""));
        assert!(value.contains("qop=auth"));
        assert!(value.contains("opaque=\"op\""));
    }
}

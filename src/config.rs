use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = "rustphone";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "rustphone.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// The transport token used in Via headers.
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

/// RFC 3261 base timer values. Tests compress these so retransmission and
/// timeout paths run in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl Timers {
    /// Total time a transaction may wait for a final response.
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,

    /// Signaling host, `host` or `host:port`.
    pub server: String,
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub display_name: Option<String>,

    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// CA bundle (PEM) trusted for the TLS transport.
    pub tls_ca: Option<String>,

    /// Local bind address; the first non-loopback interface when unset.
    pub addr: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// RTP port advertised in offers; the media collaborator owns the
    /// actual sockets.
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,

    #[serde(default = "default_true")]
    pub register: bool,
    #[serde(default = "default_register_expires")]
    pub register_expires: u32,
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    #[serde(default = "default_retry_base")]
    pub register_retry_base_secs: u64,
    #[serde(default = "default_retry_ceiling")]
    pub register_retry_ceiling_secs: u64,

    #[serde(default = "default_true")]
    pub enable_microphone: bool,
    #[serde(default = "default_true")]
    pub audio_transmit: bool,

    pub user_agent: Option<String>,

    /// RFC 3261 T1 override in milliseconds, for tests and hostile networks.
    pub sip_t1_ms: Option<u64>,
    pub sip_t2_ms: Option<u64>,
    pub sip_t4_ms: Option<u64>,
}

fn default_transport() -> TransportKind {
    TransportKind::Udp
}

fn default_port() -> u16 {
    5060
}

fn default_rtp_port() -> u16 {
    4000
}

fn default_true() -> bool {
    true
}

fn default_register_expires() -> u32 {
    3600
}

fn default_max_auth_failures() -> u32 {
    3
}

fn default_retry_base() -> u64 {
    2
}

fn default_retry_ceiling() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            server: "127.0.0.1".to_string(),
            username: "anonymous".to_string(),
            password: String::new(),
            realm: None,
            display_name: None,
            transport: default_transport(),
            tls_ca: None,
            addr: None,
            port: default_port(),
            rtp_port: default_rtp_port(),
            register: true,
            register_expires: default_register_expires(),
            max_auth_failures: default_max_auth_failures(),
            register_retry_base_secs: default_retry_base(),
            register_retry_ceiling_secs: default_retry_ceiling(),
            enable_microphone: true,
            audio_transmit: true,
            user_agent: Some(USER_AGENT.to_string()),
            sip_t1_ms: None,
            sip_t2_ms: None,
            sip_t4_ms: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Registrar host and port, defaulting the port per transport.
    pub fn server_host_port(&self) -> (String, u16) {
        let default_port = match self.transport {
            TransportKind::Tls => 5061,
            _ => 5060,
        };
        match self.server.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.server.clone(), default_port),
            },
            None => (self.server.clone(), default_port),
        }
    }

    /// Domain used in the account URIs, without any port.
    pub fn domain(&self) -> String {
        self.server_host_port().0
    }

    pub fn timers(&self) -> Timers {
        let defaults = Timers::default();
        Timers {
            t1: self
                .sip_t1_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.t1),
            t2: self
                .sip_t2_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.t2),
            t4: self
                .sip_t4_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.t4),
        }
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| USER_AGENT.to_string())
    }

    pub fn credential(&self) -> crate::auth::Credential {
        crate::auth::Credential {
            username: self.username.clone(),
            password: self.password.clone(),
            realm: self.realm.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_host_port_defaults_by_transport() {
        let mut config = Config::default();
        config.server = "sip.example.com".to_string();
        assert_eq!(
            config.server_host_port(),
            ("sip.example.com".to_string(), 5060)
        );
        config.transport = TransportKind::Tls;
        assert_eq!(
            config.server_host_port(),
            ("sip.example.com".to_string(), 5061)
        );
        config.server = "10.0.0.1:15060".to_string();
        assert_eq!(config.server_host_port(), ("10.0.0.1".to_string(), 15060));
    }

    #[test]
    fn load_minimal_toml() {
        let raw = r#"
            server = "192.168.1.42"
            username = "8181"
            password = "mohit8181"
            transport = "udp"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.username, "8181");
        assert!(config.register);
        assert!(config.enable_microphone);
        assert!(config.audio_transmit);
        assert_eq!(config.register_expires, 3600);
        assert_eq!(config.domain(), "192.168.1.42");
    }

    #[test]
    fn compressed_timers() {
        let mut config = Config::default();
        config.sip_t1_ms = Some(10);
        let timers = config.timers();
        assert_eq!(timers.t1, Duration::from_millis(10));
        assert_eq!(timers.timeout(), Duration::from_millis(640));
        assert_eq!(timers.t2, Timers::default().t2);
    }
}

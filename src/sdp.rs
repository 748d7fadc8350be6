//! Minimal SDP bodies for audio offers/answers.
//!
//! Media negotiation proper is the audio collaborator's job; the core only
//! needs a well-formed PCMU/PCMA description and the stream-direction
//! attribute that implements hold and resume.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    /// Local transmission only, the peer is on hold.
    SendOnly,
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaDirection::SendRecv => write!(f, "sendrecv"),
            MediaDirection::SendOnly => write!(f, "sendonly"),
        }
    }
}

/// Build an audio session description advertising PCMU and PCMA.
pub fn audio_body(username: &str, host: &str, port: u16, direction: MediaDirection) -> String {
    let session_id = rand::random::<u32>();
    format!(
        "v=0\r\n\
         o={username} {session_id} {session_id} IN IP4 {host}\r\n\
         s=rustphone\r\n\
         c=IN IP4 {host}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a={direction}\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_has_audio_line_and_direction() {
        let body = audio_body("8181", "192.168.1.10", 4000, MediaDirection::SendRecv);
        assert!(body.starts_with("v=0\r\n"));
        assert!(body.contains("m=audio 4000 RTP/AVP 0 8\r\n"));
        assert!(body.contains("c=IN IP4 192.168.1.10\r\n"));
        assert!(body.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn hold_flips_direction_only() {
        let active = audio_body("8181", "10.0.0.2", 4000, MediaDirection::SendRecv);
        let held = audio_body("8181", "10.0.0.2", 4000, MediaDirection::SendOnly);
        assert!(held.ends_with("a=sendonly\r\n"));
        // Everything except the origin ids and direction attribute matches.
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.starts_with("o=") && !l.starts_with("a=send"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip(&active), strip(&held));
    }
}

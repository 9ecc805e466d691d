//! Sentinel-framed text mode.
//!
//! A long-poll response body is a concatenation of
//! `#!NGINXNMS!#<json>#!NGINXNME!#` frames. A malformed frame is logged
//! and skipped; it never takes down the link or its neighbours.

use pulse_core::PulseError;
use tracing::warn;

use crate::envelope::Envelope;

/// Frame start sentinel.
pub const FRAME_START: &str = "#!NGINXNMS!#";
/// Frame end sentinel.
pub const FRAME_END: &str = "#!NGINXNME!#";

/// Decode every well-formed frame in a response body.
#[must_use]
pub fn decode_frames(body: &str) -> Vec<Envelope> {
    let mut out = Vec::new();
    for chunk in body.split(FRAME_START).skip(1) {
        let Some(json) = chunk.split(FRAME_END).next() else {
            continue;
        };
        match serde_json::from_str::<Envelope>(json) {
            Ok(env) => out.push(env),
            Err(err) => {
                warn!(%err, frame = %json.chars().take(120).collect::<String>(), "dropping malformed frame");
            }
        }
    }
    out
}

/// Encode one envelope as a sentinel-delimited frame.
pub fn encode_frame(envelope: &Envelope) -> Result<String, PulseError> {
    let json = serde_json::to_string(envelope).map_err(|err| PulseError::Protocol {
        context: format!("encode frame: {err}"),
    })?;
    Ok(format!("{FRAME_START}{json}{FRAME_END}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(module: &str, command: &str, mid: &str) -> String {
        format!(
            r#"{FRAME_START}{{"mid":"{mid}","module_id":"{module}","command":"{command}","params":{{}}}}{FRAME_END}"#
        )
    }

    // ── decoding ────────────────────────────────────────────────────

    #[test]
    fn decode_single_frame() {
        let body = frame("im", "messageAdd", "m1");
        let envs = decode_frames(&body);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].mid.as_deref(), Some("m1"));
        assert_eq!(envs[0].command, "messageAdd");
    }

    #[test]
    fn decode_concatenated_frames_in_order() {
        let body = format!(
            "{}{}{}",
            frame("im", "a", "m1"),
            frame("im", "b", "m2"),
            frame("tasks", "c", "m3")
        );
        let envs = decode_frames(&body);
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].command, "a");
        assert_eq!(envs[1].command, "b");
        assert_eq!(envs[2].module_id, "tasks");
    }

    #[test]
    fn decode_empty_body() {
        assert!(decode_frames("").is_empty());
    }

    #[test]
    fn decode_body_without_sentinels() {
        assert!(decode_frames(r#"{"module_id":"im","command":"x"}"#).is_empty());
    }

    #[test]
    fn malformed_frame_is_skipped_neighbours_survive() {
        let body = format!(
            "{}{FRAME_START}not-json{FRAME_END}{}",
            frame("im", "first", "m1"),
            frame("im", "last", "m3")
        );
        let envs = decode_frames(&body);
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0].command, "first");
        assert_eq!(envs[1].command, "last");
    }

    #[test]
    fn unterminated_frame_still_parses_remainder() {
        // A trailing start sentinel with no end: the remainder is not
        // valid JSON plus sentinel, so it is dropped.
        let body = format!("{}{FRAME_START}{{\"module_id\":", frame("im", "ok", "m1"));
        let envs = decode_frames(&body);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].command, "ok");
    }

    // ── encoding ────────────────────────────────────────────────────

    #[test]
    fn encode_roundtrip() {
        let env = Envelope::client("im", "typing", json!({"userId": 5}));
        let framed = encode_frame(&env).unwrap();
        assert!(framed.starts_with(FRAME_START));
        assert!(framed.ends_with(FRAME_END));
        let back = decode_frames(&framed);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].params["userId"], 5);
    }
}

//! Per-connection session state: dedup, resume cursor, and counters.

use std::collections::{HashMap, VecDeque};

use pulse_core::constants::RECENT_MIDS_BOUND;
use pulse_wire::Envelope;
use serde::{Deserialize, Serialize};

/// Resume cursor handed to the server on reconnect so delivery picks up
/// where the previous connection left off.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResume {
    /// Last admitted message id.
    pub mid: String,
    /// Last continuation tag, if the server sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Wall-clock time of the last admitted message, as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Message admission bookkeeping for one logical session.
///
/// Survives transport swaps and reconnects; reset only by a full
/// restart. The dedup window is a bounded FIFO, so a message older
/// than the last [`RECENT_MIDS_BOUND`] distinct ids can be delivered
/// again; consumers must tolerate that.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Last admitted message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Last continuation tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Wall-clock time of the last admitted message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Recently admitted ids, oldest first.
    #[serde(default)]
    pub recent_mids: VecDeque<String>,
    /// Admitted-message counts keyed `module/command`.
    #[serde(default)]
    pub counters: HashMap<String, u64>,
    /// Total admitted messages.
    #[serde(default)]
    pub message_count: u64,
}

impl SessionState {
    /// Decide whether an inbound envelope is new, updating the resume
    /// cursor and counters when it is.
    ///
    /// Returns `false` for a duplicate (mid already in the window).
    /// Envelopes without a mid are always admitted and never advance
    /// the cursor.
    pub fn accept(&mut self, envelope: &Envelope) -> bool {
        let Some(mid) = &envelope.mid else {
            self.count(envelope);
            return true;
        };
        if self.recent_mids.contains(mid) {
            return false;
        }
        self.recent_mids.push_back(mid.clone());
        while self.recent_mids.len() > RECENT_MIDS_BOUND {
            let _ = self.recent_mids.pop_front();
        }
        self.mid = Some(mid.clone());
        if envelope.tag.is_some() {
            self.tag.clone_from(&envelope.tag);
        }
        if envelope.time.is_some() {
            self.time.clone_from(&envelope.time);
        }
        self.count(envelope);
        true
    }

    /// Resume cursor for the next connect, if any message was admitted.
    #[must_use]
    pub fn resume(&self) -> Option<SessionResume> {
        self.mid.as_ref().map(|mid| SessionResume {
            mid: mid.clone(),
            tag: self.tag.clone(),
            time: self.time.clone(),
        })
    }

    fn count(&mut self, envelope: &Envelope) {
        let key = format!("{}/{}", envelope.module_id, envelope.command);
        *self.counters.entry(key).or_insert(0) += 1;
        self.message_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(mid: &str) -> Envelope {
        Envelope {
            mid: Some(mid.into()),
            tag: Some(format!("tag-{mid}")),
            time: Some("Fri, 29 Aug 2026 10:21:09 +0000".into()),
            module_id: "im".into(),
            command: "messageAdd".into(),
            params: json!({}),
            extra: None,
        }
    }

    #[test]
    fn duplicate_mid_is_rejected_exactly_once() {
        let mut session = SessionState::default();
        assert!(session.accept(&envelope("m1")));
        assert!(!session.accept(&envelope("m1")));
        assert_eq!(session.message_count, 1);
    }

    #[test]
    fn cursor_tracks_last_admitted_message() {
        let mut session = SessionState::default();
        let _ = session.accept(&envelope("m1"));
        let _ = session.accept(&envelope("m2"));
        let resume = session.resume().unwrap();
        assert_eq!(resume.mid, "m2");
        assert_eq!(resume.tag.as_deref(), Some("tag-m2"));
    }

    #[test]
    fn window_eviction_allows_redelivery_of_old_ids() {
        let mut session = SessionState::default();
        for i in 0..=RECENT_MIDS_BOUND {
            assert!(session.accept(&envelope(&format!("m{i}"))));
        }
        // m0 has been evicted from the window and is admitted again.
        assert!(session.accept(&envelope("m0")));
        assert_eq!(session.recent_mids.len(), RECENT_MIDS_BOUND);
    }

    #[test]
    fn midless_envelope_is_counted_but_not_cursored() {
        let mut session = SessionState::default();
        let env = Envelope::client("online", "list", json!({}));
        assert!(session.accept(&env));
        assert!(session.accept(&env));
        assert!(session.resume().is_none());
        assert_eq!(session.message_count, 2);
        assert_eq!(session.counters["online/list"], 2);
    }

    #[test]
    fn missing_tag_keeps_previous_tag() {
        let mut session = SessionState::default();
        let _ = session.accept(&envelope("m1"));
        let mut bare = envelope("m2");
        bare.tag = None;
        let _ = session.accept(&bare);
        assert_eq!(session.resume().unwrap().tag.as_deref(), Some("tag-m1"));
    }
}

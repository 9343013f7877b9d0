//! Wire constants shared by both protocols.
//!
//! Each constant is the exact token, tag or default the relay puts on the
//! wire. Frame delimiters are compiled once and matched against raw bytes;
//! both root tags are ASCII, so matching works before any text decoding.

use std::sync::LazyLock;
use std::time::Duration;

use regex::bytes::Regex;

/// Protocol constants, grouped by direction.
pub struct Wire;

impl Wire {
    // ── Upstream (relay ⇄ WAS) ──────────────────────────────────────────
    pub const GET_ALARMS_COMMAND: &str = "get-alarms";
    pub const WAS_ROOT_TAG: &str = "pdu";
    pub const WAS_DEFAULT_PORT: u16 = 47000;
    pub const WAS_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
    pub const WAS_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const WAS_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
    /// Malformed ampersand the WAS emits instead of `&amp;`.
    pub const WAS_AMPERSAND_FAULT: &str = "&amp";
    /// Upstream timestamp layout (`yyyy-MM-dd HH:mm:ss`).
    pub const WAS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    pub const RECEIVE_STATUS_TEXT: &str = "Alarmiert";
    pub const LAUNCH_STATUS_TEXT: &str = "Ausgerückt";

    // ── Downstream (relay ⇄ display clients) ────────────────────────────
    pub const AIC_ROOT_TAG: &str = "AIC";
    pub const CLIENT_DEFAULT_PORT: u16 = 55555;
    pub const CLIENT_CYCLE_INTERVAL: Duration = Duration::from_millis(500);
    pub const NETWORK_TIMEOUT: Duration = Duration::from_millis(3000);
    pub const MAX_PUSH_RETRIES: u32 = 5;
    pub const CLIENT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

    // ── Incident content ────────────────────────────────────────────────
    /// Subject of fire-alarm-system incidents whose location carries a trailing marker.
    pub const BMA_SUBJECT: &str = "BRANDMELDEALARM";
    pub const BMA_MARKER: char = '#';
}

static WAS_DELIMITER: LazyLock<Regex> = LazyLock::new(|| end_tag_pattern(Wire::WAS_ROOT_TAG));
static AIC_DELIMITER: LazyLock<Regex> = LazyLock::new(|| end_tag_pattern(Wire::AIC_ROOT_TAG));

/// End-of-document pattern for the upstream `pdu` payload.
pub fn was_delimiter() -> &'static Regex {
    &WAS_DELIMITER
}

/// End-of-document pattern for the downstream `AIC` envelope.
pub fn aic_delimiter() -> &'static Regex {
    &AIC_DELIMITER
}

/// Matches either the closing tag or a self-closed root element.
fn end_tag_pattern(root: &str) -> Regex {
    let root = regex::escape(root);
    Regex::new(&format!(r"</{root}\s*>|<{root}(?:\s[^>]*)?/>")).expect("end-tag pattern is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_matches_closing_tag() {
        let m = aic_delimiter().find(b"<AIC><MessageType>Request</MessageType></AIC><AIC>").unwrap();
        assert_eq!(m.end(), 45);
    }

    #[test]
    fn delimiter_matches_self_closed_root() {
        assert!(was_delimiter().is_match(br#"<pdu xmlns:xsi="x"/>"#));
        assert!(was_delimiter().is_match(b"<pdu/>"));
    }

    #[test]
    fn delimiter_ignores_open_document() {
        assert!(!aic_delimiter().is_match(b"<AIC><Alarms><Alarm>"));
        assert!(!was_delimiter().is_match(b"<pdu-list/>"));
    }
}

//! Upstream payload model: the `pdu` document pushed by the WAS.
//!
//! The WAS sends an ordered `order-list` of `order` records. Two payloads
//! are equal iff their record sequences are equal element-wise; that
//! equality is the only gate for raising a "payload changed" event.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::ProtocolError;
use crate::wire::Wire;

/// One upstream alarm record (`order`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasAlarm {
    /// Position inside the payload, reassigned by [`WasObject::set_indexes`].
    #[serde(rename = "@index", default)]
    pub index: i32,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "origin", default)]
    pub alarm_station: String,
    #[serde(rename = "receive-tad", default)]
    pub receive_time: String,
    #[serde(rename = "operation-id", default)]
    pub id: String,
    #[serde(rename = "level", default)]
    pub alarm_level: i32,
    #[serde(rename = "name", default)]
    pub caller_name: String,
    #[serde(rename = "operation-name", default)]
    pub subject: String,
    #[serde(rename = "caller", default)]
    pub caller_telephone_number: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "info", default)]
    pub additional_information: String,
    #[serde(rename = "status", default)]
    pub status_text: String,
    #[serde(rename = "watch-out-tad", default)]
    pub watch_out_time: String,
    #[serde(rename = "finished-tad", default)]
    pub finished_time: String,
    #[serde(rename = "program", default)]
    pub siren_program: String,
    #[serde(rename = "destination-list", default, with = "destination_list")]
    pub fire_brigades: Vec<String>,
}

impl WasAlarm {
    /// 0 while the incident is only received, 1 once units have committed.
    pub fn status(&self) -> i32 {
        if self.status_text.to_lowercase() == Wire::RECEIVE_STATUS_TEXT.to_lowercase() {
            0
        } else {
            1
        }
    }

    pub fn start_time(&self) -> Option<NaiveDateTime> {
        parse_was_time(&self.receive_time)
    }

    pub fn launch_time(&self) -> Option<NaiveDateTime> {
        parse_was_time(&self.watch_out_time)
    }

    pub fn end_time(&self) -> Option<NaiveDateTime> {
        parse_was_time(&self.finished_time)
    }
}

impl std::fmt::Display for WasAlarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.id.is_empty() {
            return Ok(());
        }
        write!(f, "{} - {}: {}", self.status_text, self.id, self.location)
    }
}

/// The full upstream payload (`pdu`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasObject {
    #[serde(rename = "order-list", default, with = "order_list")]
    pub alarms: Vec<WasAlarm>,
}

impl WasObject {
    pub fn new(alarms: Vec<WasAlarm>) -> Self {
        Self { alarms }
    }

    /// Sort records by `Id` and number them 1..N so that equal content
    /// always compares equal regardless of the order the WAS sent it in.
    ///
    /// Records without an `Id` sort ahead of every other record, keeping
    /// their received order among themselves, so the ordering stays total.
    pub fn set_indexes(&mut self) {
        self.alarms.sort_by(|a, b| a.id.cmp(&b.id));
        for (i, alarm) in self.alarms.iter_mut().enumerate() {
            alarm.index = i as i32 + 1;
        }
    }

    /// Decode one framed payload received from the WAS.
    ///
    /// Tries UTF-8 first and falls back to code page 28605, which is what
    /// the WAS actually emits for most of its documents.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        codec::decode_was(bytes)
    }

    /// Encode the payload the way the WAS does (ISO-8859-15 bytes).
    ///
    /// With `apply_ampersand_fault` the upstream's broken `&amp` escape is
    /// reproduced, which is what a WAS simulator needs to send.
    pub fn encode(&self, apply_ampersand_fault: bool) -> Result<Vec<u8>, ProtocolError> {
        codec::encode_was(self, apply_ampersand_fault)
    }
}

/// Parse an upstream timestamp; anything unparsable is treated as unset.
pub fn parse_was_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(text, Wire::WAS_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

mod destination_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Out<'a> {
        destination: &'a [String],
    }

    #[derive(Deserialize)]
    struct In {
        #[serde(default)]
        destination: Vec<String>,
    }

    pub fn serialize<S: Serializer>(items: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        Out { destination: items }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        In::deserialize(deserializer).map(|list| list.destination)
    }
}

mod order_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::WasAlarm;

    #[derive(Serialize)]
    struct Out<'a> {
        order: &'a [WasAlarm],
    }

    #[derive(Deserialize)]
    struct In {
        #[serde(default)]
        order: Vec<WasAlarm>,
    }

    pub fn serialize<S: Serializer>(items: &[WasAlarm], serializer: S) -> Result<S::Ok, S::Error> {
        Out { order: items }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<WasAlarm>, D::Error> {
        In::deserialize(deserializer).map(|list| list.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> WasAlarm {
        WasAlarm {
            id: id.into(),
            status_text: "Alarmiert".into(),
            location: "WELS".into(),
            ..Default::default()
        }
    }

    #[test]
    fn set_indexes_sorts_by_id() {
        let mut payload = WasObject::new(vec![record("B"), record("C"), record("A")]);
        payload.set_indexes();
        let ids: Vec<_> = payload.alarms.iter().map(|a| (a.id.as_str(), a.index)).collect();
        assert_eq!(ids, vec![("A", 1), ("B", 2), ("C", 3)]);
    }

    #[test]
    fn records_without_id_sort_first() {
        let mut first = record("");
        first.location = "FIRST".into();
        let mut second = record("");
        second.location = "SECOND".into();
        let mut payload = WasObject::new(vec![record("B"), first, record("A"), second]);
        payload.set_indexes();
        let order: Vec<_> = payload
            .alarms
            .iter()
            .map(|a| (a.id.as_str(), a.location.as_str(), a.index))
            .collect();
        assert_eq!(
            order,
            vec![("", "FIRST", 1), ("", "SECOND", 2), ("A", "WELS", 3), ("B", "WELS", 4)]
        );
    }

    #[test]
    fn equality_is_element_wise() {
        let a = WasObject::new(vec![record("A"), record("B")]);
        let b = WasObject::new(vec![record("A"), record("B")]);
        let reordered = WasObject::new(vec![record("B"), record("A")]);
        assert_eq!(a, b);
        assert_ne!(a, reordered);
    }

    #[test]
    fn status_is_zero_only_for_received() {
        let mut alarm = record("A");
        assert_eq!(alarm.status(), 0);
        alarm.status_text = "ALARMIERT".into();
        assert_eq!(alarm.status(), 0);
        alarm.status_text = Wire::LAUNCH_STATUS_TEXT.into();
        assert_eq!(alarm.status(), 1);
    }

    #[test]
    fn times_parse_upstream_format() {
        let mut alarm = record("A");
        alarm.receive_time = "2024-03-01 13:45:10".into();
        alarm.finished_time = "not a time".into();
        assert_eq!(
            alarm.start_time().map(|t| t.to_string()),
            Some("2024-03-01 13:45:10".to_string())
        );
        assert_eq!(alarm.end_time(), None);
        assert_eq!(alarm.launch_time(), None);
    }

    #[test]
    fn display_omits_records_without_id() {
        assert_eq!(record("").to_string(), "");
        assert_eq!(record("E-1").to_string(), "Alarmiert - E-1: WELS");
    }
}

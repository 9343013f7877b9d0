//! Incident model: the `Alarm` element carried inside every envelope.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::ProtocolError;
use crate::was::WasAlarm;
use crate::wire::Wire;

/// One dispatch incident as shown to display clients.
///
/// Field order matches the element order of the `Alarm` element on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Alarm {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub location: String,
    /// Location guessed from the free text; empty when no guess exists.
    #[serde(default)]
    pub location_proposition: String,
    #[serde(default)]
    pub additional_information: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveDateTime>,
    /// 0 = received, 1 = committed.
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub alarm_station: String,
    #[serde(default)]
    pub alarm_level: i32,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub caller_telephone_number: String,
    #[serde(default)]
    pub siren_program: String,
    #[serde(default, with = "fire_brigade_list")]
    pub fire_brigades: Vec<String>,
}

impl Alarm {
    /// Transform an upstream record into an incident.
    ///
    /// Fire-alarm-system incidents carry a `#` marker and detector code after
    /// the address; everything from the marker on is cut off.
    pub fn from_was(record: &WasAlarm) -> Self {
        let mut location = record.location.clone();
        if record.subject.eq_ignore_ascii_case(Wire::BMA_SUBJECT) {
            if let Some(pos) = location.find(Wire::BMA_MARKER) {
                location = location[..pos].trim().to_string();
            }
        }

        Self {
            id: record.id.clone(),
            subject: record.subject.clone(),
            location,
            location_proposition: String::new(),
            additional_information: record.additional_information.clone(),
            start_time: record.start_time(),
            launch_time: record.launch_time(),
            end_time: record.end_time(),
            status: record.status(),
            alarm_station: record.alarm_station.clone(),
            alarm_level: record.alarm_level,
            caller_name: record.caller_name.clone(),
            caller_telephone_number: record.caller_telephone_number.clone(),
            siren_program: record.siren_program.clone(),
            fire_brigades: record
                .fire_brigades
                .iter()
                .filter(|unit| !unit.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn is_fire(&self) -> bool {
        self.subject.to_lowercase().contains("brand")
    }

    /// The location to geocode: the proposition when one exists.
    pub fn map_location(&self) -> &str {
        if self.location_proposition.trim().is_empty() {
            &self.location
        } else {
            &self.location_proposition
        }
    }

    /// Caller name and number combined as `name (number)`.
    pub fn caller(&self) -> String {
        let name = self.caller_name.trim();
        let number = self.caller_telephone_number.trim();
        match (name.is_empty(), number.is_empty()) {
            (false, false) => format!("{} ({})", self.caller_name, self.caller_telephone_number),
            (false, true) => self.caller_name.clone(),
            (true, false) => self.caller_telephone_number.clone(),
            (true, true) => String::new(),
        }
    }

    /// Serialize a standalone `Alarm` element (used by the upload collaborator).
    pub fn to_xml(&self) -> Result<String, ProtocolError> {
        codec::encode_alarm(self)
    }
}

mod fire_brigade_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Out<'a> {
        #[serde(rename = "FireBrigade")]
        items: &'a [String],
    }

    #[derive(Deserialize)]
    struct In {
        #[serde(rename = "FireBrigade", default)]
        items: Vec<String>,
    }

    pub fn serialize<S: Serializer>(items: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        Out { items }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        In::deserialize(deserializer).map(|list| list.items)
    }
}

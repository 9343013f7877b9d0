//! XML codecs for both documents.
//!
//! Envelopes travel as UTF-8. WAS payloads are nominally code page 28605
//! (ISO-8859-15) but the sender is inconsistent about it, so decoding tries
//! UTF-8 first and falls back to 28605. The WAS also writes `&amp` without
//! the terminating semicolon; that fault is repaired before parsing and can
//! be reproduced on encode.

use std::borrow::Cow;

use encoding_rs::ISO_8859_15;
use serde::{Deserialize, Serialize};

use crate::alarm::Alarm;
use crate::error::ProtocolError;
use crate::message::{AicMessage, MessageKind};
use crate::was::WasObject;
use crate::wire::Wire;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const UTF8_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;
const WAS_DECLARATION: &str = r#"<?xml version="1.0" encoding="iso-8859-15"?>"#;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AicDocumentOut<'a> {
    #[serde(rename = "MessageType")]
    message_type: &'a str,
    #[serde(rename = "ConnectionWasToServerOk")]
    connection_was_to_server_ok: bool,
    #[serde(rename = "Alarms")]
    alarms: AlarmListOut<'a>,
}

#[derive(Serialize)]
struct AlarmListOut<'a> {
    #[serde(rename = "Alarm")]
    items: &'a [Alarm],
}

#[derive(Deserialize)]
struct AicDocumentIn {
    #[serde(rename = "MessageType", default)]
    message_type: String,
    #[serde(rename = "ConnectionWasToServerOk", default)]
    connection_was_to_server_ok: bool,
    #[serde(rename = "Alarms", default)]
    alarms: AlarmListIn,
}

#[derive(Deserialize, Default)]
struct AlarmListIn {
    #[serde(rename = "Alarm", default)]
    items: Vec<Alarm>,
}

pub(crate) fn encode_aic(message: &AicMessage) -> Result<Vec<u8>, ProtocolError> {
    let document = AicDocumentOut {
        message_type: message.kind.as_str(),
        connection_was_to_server_ok: message.was_connected,
        alarms: AlarmListOut {
            items: &message.alarms,
        },
    };
    let body = quick_xml::se::to_string_with_root(Wire::AIC_ROOT_TAG, &document)
        .map_err(|e| ProtocolError::encode("AIC", e))?;
    Ok(format!("{UTF8_DECLARATION}{body}").into_bytes())
}

pub(crate) fn decode_aic(bytes: &[u8]) -> Result<AicMessage, ProtocolError> {
    let text = std::str::from_utf8(strip_bom(bytes))
        .map_err(|_| ProtocolError::Encoding { encoding: "UTF-8" })?;
    let document: AicDocumentIn =
        quick_xml::de::from_str(text.trim()).map_err(|e| ProtocolError::malformed("AIC", e))?;

    Ok(AicMessage {
        kind: MessageKind::parse(&document.message_type)?,
        was_connected: document.connection_was_to_server_ok,
        alarms: document.alarms.items,
    })
}

pub(crate) fn encode_alarm(alarm: &Alarm) -> Result<String, ProtocolError> {
    let body = quick_xml::se::to_string_with_root("Alarm", alarm)
        .map_err(|e| ProtocolError::encode("Alarm", e))?;
    Ok(format!("{UTF8_DECLARATION}{body}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// WAS payload
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn decode_was(bytes: &[u8]) -> Result<WasObject, ProtocolError> {
    let first = std::str::from_utf8(strip_bom(bytes))
        .map_err(|_| ProtocolError::Encoding { encoding: "UTF-8" })
        .and_then(parse_was);

    match first {
        Ok(payload) => Ok(payload),
        Err(_) => {
            // Single-byte code page: every byte maps, so decoding never fails.
            let (text, _) = ISO_8859_15.decode_without_bom_handling(bytes);
            parse_was(&text)
        }
    }
}

pub(crate) fn encode_was(
    payload: &WasObject,
    apply_ampersand_fault: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let body = quick_xml::se::to_string_with_root(Wire::WAS_ROOT_TAG, payload)
        .map_err(|e| ProtocolError::encode("pdu", e))?;
    let mut text = format!("{WAS_DECLARATION}{body}");
    if apply_ampersand_fault {
        text = inject_ampersand_fault(&text);
    }
    let (bytes, _, _) = ISO_8859_15.encode(&text);
    Ok(bytes.into_owned())
}

fn parse_was(text: &str) -> Result<WasObject, ProtocolError> {
    let repaired = repair_ampersands(text.trim());
    quick_xml::de::from_str(&repaired).map_err(|e| ProtocolError::malformed("pdu", e))
}

/// Turn every `&amp` that is not already followed by `;` into `&amp;`.
///
/// Correctly escaped ampersands are left alone.
pub fn repair_ampersands(text: &str) -> Cow<'_, str> {
    let fault = Wire::WAS_AMPERSAND_FAULT;
    if !text.contains(fault) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + 8);
    let mut rest = text;
    while let Some(pos) = rest.find(fault) {
        let end = pos + fault.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];
        if !rest.starts_with(';') {
            out.push(';');
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Reproduce the WAS fault: strip the semicolon from every `&amp;`.
pub fn inject_ampersand_fault(text: &str) -> String {
    text.replace("&amp;", Wire::WAS_AMPERSAND_FAULT)
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

// src/types.rs
use serde::{Deserialize, Serialize};

use crate::error::TagError;
use crate::records::{ActionKind, GeoStyle};
use crate::session::ConnectionMode;

/// Alert severity, mirrored to the host UI.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Confirmation,
    Warning,
    Error,
}

// Messages sent TO the WebSocket client (host UI)
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    READER_STATUS { success: bool },
    CARD_STATUS { success: bool, message: String },
    TAG_SUCCESS { message: String },
    TAG_ERROR { error: String },
    ALERT { title: String, text: String, severity: Severity },
    TAG_INFO { text: String },
    RAW_DUMP { data: String },
    READER_ERROR { error: String },
}

/// The operation to run on the next tag touch. Binary fields travel as
/// hex strings; datetimes as ISO 8601 civil datetimes.
#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "op")]
pub enum TagOperation {
    READ,
    DELETE,
    WRITE_URI { uri: String },
    WRITE_TEXT { text: String, language: String },
    WRITE_SMART_POSTER {
        uri: Option<String>,
        title: Option<String>,
        action: Option<u8>,
        image_hex: Option<String>,
        image_name: Option<String>,
    },
    WRITE_SMS {
        number: String,
        body: String,
        title: Option<String>,
        action: Option<u8>,
    },
    WRITE_ANNOTATED_URL { uri: String, text: String },
    WRITE_IMAGE { data_hex: String, filename: String },
    WRITE_GEO { latitude: f64, longitude: f64, style: u8 },
    WRITE_CUSTOM { type_uri: String, payload_hex: String },
    WRITE_COMBINATION {
        uri: String,
        type_uri: String,
        payload_hex: String,
    },
    WRITE_VCALENDAR {
        summary: String,
        start: String,
        end: String,
        utc: bool,
    },
    CLONE,
    READ_RAW { key_hex: Option<String> },
    WRITE_RAW { data_hex: String, key_hex: Option<String> },
}

// Messages received FROM the WebSocket client
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    GET_READER_STATUS,
    SET_MODE { raw: bool },
    SET_OPERATION(TagOperation),
}

// Internal commands sent from WS server -> NFC thread
#[derive(Debug)]
pub enum NfcCommand {
    SetMode(ConnectionMode),
    SetOperation(TagOperation),
    CheckReaderStatus,
}

/// Connection-name token that marks a target as raw-block capable.
pub const MIFARE_RAW_TOKEN: &str = "mifare-classic-1k";

pub fn action_from_code(code: u8) -> Result<ActionKind, TagError> {
    match code {
        0 => Ok(ActionKind::Execute),
        1 => Ok(ActionKind::Save),
        2 => Ok(ActionKind::Edit),
        other => Err(TagError::Encoding(format!("unknown action code {other}"))),
    }
}

pub fn geo_style_from_code(code: u8) -> Result<GeoStyle, TagError> {
    match code {
        0 => Ok(GeoStyle::GeoUri),
        1 => Ok(GeoStyle::OviMaps),
        2 => Ok(GeoStyle::NfcInteractor),
        other => Err(TagError::Encoding(format!("unknown geo style {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_commands_deserialize() {
        let msg: IncomingMessage = serde_json::from_str(
            r#"{"type":"SET_OPERATION","op":"WRITE_URI","uri":"http://nokia.com/"}"#,
        )
        .unwrap();
        match msg {
            IncomingMessage::SET_OPERATION(TagOperation::WRITE_URI { uri }) => {
                assert_eq!(uri, "http://nokia.com/")
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&OutgoingMessage::ALERT {
            title: "t".into(),
            text: "x".into(),
            severity: Severity::Warning,
        })
        .unwrap();
        assert!(json.contains(r#""severity":"warning""#));
    }

    #[test]
    fn action_and_geo_codes() {
        assert_eq!(action_from_code(2).unwrap(), ActionKind::Edit);
        assert!(action_from_code(3).is_err());
        assert_eq!(geo_style_from_code(0).unwrap(), GeoStyle::GeoUri);
        assert!(geo_style_from_code(9).is_err());
    }
}

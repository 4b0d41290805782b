// src/controller.rs
//
// Binds pending operations to a connected session and reports results
// through the host callback surface. The clone cache lives here: the
// session itself has no memory across touches.

use crossbeam_channel::Sender;
use log::info;

use crate::error::TagError;
use crate::ndef::Message;
use crate::records::{
    empty_record, external_record, geo_record, image_record, sms_record, smart_poster_record,
    text_record, uri_record, vcalendar_record, SmartPosterParts,
};
use crate::session::{ConnectionMode, MifareKey, TagSession};
use crate::types::{
    action_from_code, geo_style_from_code, OutgoingMessage, Severity, TagOperation,
};

/// Host callback surface. One implementation forwards over the event
/// channel; tests record calls instead.
pub trait InfoSink: Send {
    fn tag_success(&self, text: &str);
    fn tag_error(&self, text: &str);
    fn display_alert(&self, title: &str, text: &str, severity: Severity);
    fn log_tag_info(&self, text: &str);
    /// Raw dump hand-off to the host; dumps are not persisted here.
    fn raw_dump(&self, _data: &[u8]) {}
}

/// Forwards callbacks as WebSocket events.
pub struct ChannelSink {
    tx: Sender<OutgoingMessage>,
}

impl ChannelSink {
    pub fn new(tx: Sender<OutgoingMessage>) -> ChannelSink {
        ChannelSink { tx }
    }
}

impl InfoSink for ChannelSink {
    fn tag_success(&self, text: &str) {
        let _ = self.tx.send(OutgoingMessage::TAG_SUCCESS {
            message: text.into(),
        });
    }

    fn tag_error(&self, text: &str) {
        let _ = self.tx.send(OutgoingMessage::TAG_ERROR { error: text.into() });
    }

    fn display_alert(&self, title: &str, text: &str, severity: Severity) {
        let _ = self.tx.send(OutgoingMessage::ALERT {
            title: title.into(),
            text: text.into(),
            severity,
        });
    }

    fn log_tag_info(&self, text: &str) {
        let _ = self.tx.send(OutgoingMessage::TAG_INFO { text: text.into() });
    }

    fn raw_dump(&self, data: &[u8]) {
        let _ = self.tx.send(OutgoingMessage::RAW_DUMP {
            data: hex::encode(data),
        });
    }
}

pub struct TagController {
    sink: Box<dyn InfoSink>,
    mode: ConnectionMode,
    pending: TagOperation,
    cached_message: Option<Message>,
}

impl TagController {
    pub fn new(sink: Box<dyn InfoSink>) -> TagController {
        TagController {
            sink,
            mode: ConnectionMode::Ndef,
            pending: TagOperation::READ,
            cached_message: None,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ConnectionMode) {
        self.mode = mode;
    }

    pub fn set_operation(&mut self, op: TagOperation) {
        info!("pending operation: {op:?}");
        self.pending = op;
    }

    pub fn sink(&self) -> &dyn InfoSink {
        self.sink.as_ref()
    }

    /// Worker entry point: a session is connected, run the pending
    /// operation and report. Called exactly once per tag touch.
    pub fn tag_ready(&mut self, session: &mut TagSession) {
        let op = self.pending.clone();
        if let Err(err) = self.execute(&op, session) {
            self.report_error(&err);
        }
    }

    fn execute(&mut self, op: &TagOperation, session: &mut TagSession) -> Result<(), TagError> {
        match op {
            TagOperation::READ => self.read_and_display(session),
            TagOperation::DELETE => self.delete_message(session),
            TagOperation::WRITE_URI { uri } => {
                self.write_single(session, uri_record(uri)?, "URI written")
            }
            TagOperation::WRITE_TEXT { text, language } => {
                self.write_single(session, text_record(text, language)?, "Text written")
            }
            TagOperation::WRITE_SMART_POSTER {
                uri,
                title,
                action,
                image_hex,
                image_name,
            } => {
                let image = match (image_hex, image_name) {
                    (Some(hex_data), Some(name)) => Some((decode_hex(hex_data)?, name.clone())),
                    (None, None) => None,
                    _ => {
                        return Err(TagError::Encoding(
                            "image data and filename must be given together".into(),
                        ));
                    }
                };
                let parts = SmartPosterParts {
                    uri: uri.clone(),
                    title: title.clone(),
                    action: action.map(action_from_code).transpose()?,
                    image,
                };
                self.write_single(session, smart_poster_record(&parts)?, "Smart Poster written")
            }
            TagOperation::WRITE_SMS {
                number,
                body,
                title,
                action,
            } => {
                let action = action.map(action_from_code).transpose()?;
                let rec = sms_record(number, body, title.as_deref(), action)?;
                self.write_single(session, rec, "Sms tag written")
            }
            TagOperation::WRITE_ANNOTATED_URL { uri, text } => {
                let mut message = Message::new();
                message.append_record(uri_record(uri)?);
                message.append_record(text_record(text, "en")?);
                session.write_ndef(&message)?;
                self.sink.tag_success("Annotated URL tag written");
                Ok(())
            }
            TagOperation::WRITE_IMAGE { data_hex, filename } => {
                let data = decode_hex(data_hex)?;
                self.write_single(session, image_record(&data, filename)?, "Image written")
            }
            TagOperation::WRITE_GEO {
                latitude,
                longitude,
                style,
            } => {
                let style = geo_style_from_code(*style)?;
                self.write_single(
                    session,
                    geo_record(*latitude, *longitude, style)?,
                    "Geo URI written",
                )
            }
            TagOperation::WRITE_CUSTOM {
                type_uri,
                payload_hex,
            } => {
                let payload = decode_hex(payload_hex)?;
                self.write_single(
                    session,
                    external_record(type_uri, &payload)?,
                    "Custom tag written",
                )
            }
            TagOperation::WRITE_COMBINATION {
                uri,
                type_uri,
                payload_hex,
            } => {
                let payload = decode_hex(payload_hex)?;
                let mut message = Message::new();
                message.append_record(external_record(type_uri, &payload)?);
                message.append_record(uri_record(uri)?);
                session.write_ndef(&message)?;
                self.sink.tag_success("Combination tag written");
                Ok(())
            }
            TagOperation::WRITE_VCALENDAR {
                summary,
                start,
                end,
                utc,
            } => {
                let start = parse_datetime(start)?;
                let end = parse_datetime(end)?;
                self.write_single(
                    session,
                    vcalendar_record(summary, start, end, *utc)?,
                    "vCalendar written",
                )
            }
            TagOperation::CLONE => self.clone_touch(session),
            TagOperation::READ_RAW { key_hex } => {
                let key = key_hex.as_deref().map(decode_key).transpose()?;
                self.read_raw(session, key)
            }
            TagOperation::WRITE_RAW { data_hex, key_hex } => {
                let data = decode_hex(data_hex)?;
                let key = key_hex.as_deref().map(decode_key).transpose()?;
                self.write_raw(session, &data, key)
            }
        }
    }

    /// Read the tag and surface each record: well-known types get their
    /// own alert, everything else a generic description. Payloads are
    /// echoed, not parsed.
    fn read_and_display(&mut self, session: &mut TagSession) -> Result<(), TagError> {
        let message = session.read_ndef()?;
        let mut contents = String::new();
        if message.is_empty() {
            self.sink.display_alert(
                "Read NDEF",
                "No records in the message.",
                Severity::Error,
            );
            contents.push_str("No records in this message\n");
        } else {
            let total = message.len();
            for (i, rec) in message.records().iter().enumerate() {
                let shown = match rec.type_name() {
                    Some("Sp") => Some("Smart Poster"),
                    Some("U") => Some("Url"),
                    Some("T") => Some("Text"),
                    _ => None,
                };
                if let Some(title) = shown {
                    let payload = String::from_utf8_lossy(&rec.payload).into_owned();
                    self.sink
                        .display_alert(title, &payload, Severity::Confirmation);
                    contents.push_str(&format!("{title}\n{payload}\n"));
                } else {
                    let name = rec.type_name().unwrap_or("<binary>");
                    let text = format!("Format = {:?}, Name = {name}\n", rec.tnf);
                    self.sink.display_alert(
                        &format!("Record {}/{total}", i + 1),
                        &text,
                        Severity::Confirmation,
                    );
                    contents.push_str(&format!("Record {}/{total}\n{text}", i + 1));
                }
            }
        }
        self.sink.log_tag_info(&contents);
        Ok(())
    }

    /// Blank the tag by writing a single empty record; a tag that is
    /// already empty is left alone.
    fn delete_message(&mut self, session: &mut TagSession) -> Result<(), TagError> {
        let message = session.read_ndef()?;
        if message.is_empty() {
            self.sink.tag_success("Tag already empty");
            return Ok(());
        }
        let mut empty = Message::new();
        empty.append_record(empty_record());
        session.write_ndef(&empty)?;
        self.sink.tag_success("Wrote empty message.");
        Ok(())
    }

    /// One touch of the two-phase clone flow. First touch: read and
    /// cache. Second touch: write the cached message and clear the cache.
    fn clone_touch(&mut self, session: &mut TagSession) -> Result<(), TagError> {
        match self.cached_message.take() {
            None => {
                let message = session.read_ndef()?;
                if message.is_empty() {
                    return Err(TagError::Format(
                        "nothing to learn: tag has no message".into(),
                    ));
                }
                self.cached_message = Some(message);
                self.sink.tag_success("Learned message from tag");
                Ok(())
            }
            Some(message) => {
                if let Err(err) = session.write_ndef(&message) {
                    // Keep the cache so another target can be touched.
                    self.cached_message = Some(message);
                    return Err(err);
                }
                self.sink.tag_success("Tag clone written");
                Ok(())
            }
        }
    }

    fn read_raw(
        &mut self,
        session: &mut TagSession,
        key: Option<MifareKey>,
    ) -> Result<(), TagError> {
        if self.mode != ConnectionMode::Raw {
            return Err(TagError::Config(
                "unable to read raw data: app is in NDEF mode".into(),
            ));
        }
        let dump = session.read_raw(key)?;
        self.sink.raw_dump(&dump);
        self.sink.display_alert(
            "Mifare tag read",
            "Mifare data handed to host",
            Severity::Confirmation,
        );
        self.sink
            .log_tag_info(&format!("Mifare tag\nRead: {} bytes", dump.len()));
        Ok(())
    }

    fn write_raw(
        &mut self,
        session: &mut TagSession,
        data: &[u8],
        key: Option<MifareKey>,
    ) -> Result<(), TagError> {
        if self.mode != ConnectionMode::Raw {
            return Err(TagError::Config(
                "unable to write raw data: app is in NDEF mode".into(),
            ));
        }
        session.write_raw(data, key)?;
        self.sink.display_alert(
            "Mifare tag written",
            &format!("Mifare data written to tag ({} bytes)", data.len()),
            Severity::Confirmation,
        );
        Ok(())
    }

    fn write_single(
        &mut self,
        session: &mut TagSession,
        record: crate::ndef::Record,
        success: &str,
    ) -> Result<(), TagError> {
        let mut message = Message::new();
        message.append_record(record);
        session.write_ndef(&message)?;
        self.sink.tag_success(success);
        Ok(())
    }

    fn report_error(&self, err: &TagError) {
        let title = match err {
            TagError::Config(_) => "Configuration error",
            TagError::Transport(_) => "Communication problem",
            TagError::Overflow(_) => "Not enough space on the tag",
            TagError::Disconnected(_) => "Tag lost",
            TagError::Format(_) => "Unsupported tag content",
            TagError::Auth(_) => "Authentication error",
            TagError::Encoding(_) => "Invalid input",
        };
        self.sink.display_alert(title, &err.to_string(), Severity::Error);
        self.sink.tag_error(&err.to_string());
    }
}

fn decode_hex(data: &str) -> Result<Vec<u8>, TagError> {
    hex::decode(data).map_err(|e| TagError::Encoding(format!("invalid hex payload: {e}")))
}

fn decode_key(key_hex: &str) -> Result<MifareKey, TagError> {
    let bytes = decode_hex(key_hex)?;
    bytes
        .try_into()
        .map_err(|_| TagError::Encoding("authentication key must be 6 bytes".into()))
}

fn parse_datetime(value: &str) -> Result<jiff::civil::DateTime, TagError> {
    value
        .parse()
        .map_err(|e| TagError::Encoding(format!("invalid datetime {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndef::parse_message;
    use crate::session::fakes::FakeTarget;
    use crate::session::Target;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        pub events: Arc<Mutex<Vec<String>>>,
    }

    impl InfoSink for RecordingSink {
        fn tag_success(&self, text: &str) {
            self.events.lock().unwrap().push(format!("success: {text}"));
        }

        fn tag_error(&self, text: &str) {
            self.events.lock().unwrap().push(format!("error: {text}"));
        }

        fn display_alert(&self, title: &str, text: &str, severity: Severity) {
            self.events
                .lock()
                .unwrap()
                .push(format!("alert[{severity:?}] {title}: {text}"));
        }

        fn log_tag_info(&self, text: &str) {
            self.events.lock().unwrap().push(format!("info: {text}"));
        }

        fn raw_dump(&self, data: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("dump: {}", hex::encode(data)));
        }
    }

    fn controller() -> (TagController, Arc<Mutex<Vec<String>>>) {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        (TagController::new(Box::new(sink)), events)
    }

    fn ndef_session(target: &FakeTarget) -> TagSession {
        let targets: Vec<Box<dyn Target>> = vec![Box::new(FakeTarget {
            ndef: true,
            name: target.name.clone(),
            stored: target.stored.clone(),
            blocks: target.blocks.clone(),
            key: target.key,
            fail_reads: target.fail_reads,
            live: target.live.clone(),
        })];
        TagSession::open(&targets, ConnectionMode::Ndef, "mifare-classic-1k").unwrap()
    }

    #[test]
    fn write_uri_produces_scenario_bytes() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        let mut session = ndef_session(&target);

        ctl.set_operation(TagOperation::WRITE_URI {
            uri: "http://nokia.com/".into(),
        });
        ctl.tag_ready(&mut session);

        let stored = target.stored.lock().unwrap().clone();
        assert_eq!(
            stored,
            [
                0xD1, 0x01, 0x0B, b'U', 0x03, 0x6E, 0x6F, 0x6B, 0x69, 0x61, 0x2E, 0x63, 0x6F,
                0x6D, 0x2F
            ]
        );
        assert!(events.lock().unwrap().iter().any(|e| e == "success: URI written"));
    }

    #[test]
    fn read_reports_each_record() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        {
            let mut msg = Message::new();
            msg.append_record(uri_record("http://nokia.com/").unwrap());
            msg.append_record(text_record("Nokia", "en").unwrap());
            *target.stored.lock().unwrap() = msg.to_bytes().unwrap();
        }
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session); // default op is READ

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.contains("Url")));
        assert!(events.iter().any(|e| e.contains("Text")));
        assert!(events.last().unwrap().starts_with("info: "));
    }

    #[test]
    fn read_of_blank_tag_is_not_an_error() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.contains("No records in the message.")));
        assert!(!events.iter().any(|e| e.starts_with("error:")));
    }

    #[test]
    fn delete_blanks_a_written_tag_and_skips_an_empty_one() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        {
            let mut msg = Message::new();
            msg.append_record(text_record("x", "en").unwrap());
            *target.stored.lock().unwrap() = msg.to_bytes().unwrap();
        }
        ctl.set_operation(TagOperation::DELETE);

        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);
        assert!(events.lock().unwrap().iter().any(|e| e == "success: Wrote empty message."));
        let stored = target.stored.lock().unwrap().clone();
        let parsed = parse_message(&stored).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.records()[0], empty_record());

        // second pass sees one empty record, which still counts as content;
        // blank the store to simulate a factory-fresh tag
        target.stored.lock().unwrap().clear();
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);
        assert!(events.lock().unwrap().iter().any(|e| e == "success: Tag already empty"));
    }

    #[test]
    fn clone_flow_spans_two_touches() {
        let (mut ctl, events) = controller();
        let source = FakeTarget::ndef_target();
        let blank = FakeTarget::ndef_target();
        let original = {
            let mut msg = Message::new();
            msg.append_record(uri_record("http://nokia.com/").unwrap());
            msg.append_record(text_record("Nokia", "en").unwrap());
            let bytes = msg.to_bytes().unwrap();
            *source.stored.lock().unwrap() = bytes.clone();
            bytes
        };
        ctl.set_operation(TagOperation::CLONE);

        // first touch: learn
        let mut session = ndef_session(&source);
        ctl.tag_ready(&mut session);
        session.close();
        assert!(ctl.cached_message.is_some());
        assert!(events.lock().unwrap().iter().any(|e| e == "success: Learned message from tag"));

        // second touch: write the exact bytes, cache cleared
        let mut session = ndef_session(&blank);
        ctl.tag_ready(&mut session);
        session.close();
        assert_eq!(*blank.stored.lock().unwrap(), original);
        assert!(ctl.cached_message.is_none());
        assert!(events.lock().unwrap().iter().any(|e| e == "success: Tag clone written"));
    }

    #[test]
    fn clone_of_blank_tag_fails_without_caching() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        ctl.set_operation(TagOperation::CLONE);
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);
        assert!(ctl.cached_message.is_none());
        assert!(events.lock().unwrap().iter().any(|e| e.starts_with("error:")));
    }

    #[test]
    fn raw_read_in_ndef_mode_is_a_config_error() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        ctl.set_operation(TagOperation::READ_RAW { key_hex: None });
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.contains("app is in NDEF mode")));
    }

    #[test]
    fn raw_round_trip_through_operations() {
        let (mut ctl, events) = controller();
        ctl.set_mode(ConnectionMode::Raw);

        let target = FakeTarget::raw_target("mifare-classic-1k");
        target.blocks.lock().unwrap()[5] = 0x42;
        let open = |t: &FakeTarget| -> TagSession {
            let targets: Vec<Box<dyn Target>> = vec![Box::new(FakeTarget {
                ndef: false,
                name: t.name.clone(),
                stored: t.stored.clone(),
                blocks: t.blocks.clone(),
                key: t.key,
                fail_reads: false,
                live: t.live.clone(),
            })];
            TagSession::open(&targets, ConnectionMode::Raw, "mifare-classic-1k").unwrap()
        };

        ctl.set_operation(TagOperation::READ_RAW { key_hex: None });
        let mut session = open(&target);
        ctl.tag_ready(&mut session);
        {
            let events = events.lock().unwrap();
            let dump = events.iter().find(|e| e.starts_with("dump: ")).unwrap();
            assert_eq!(dump.len(), "dump: ".len() + 64 * 2);
        }

        ctl.set_operation(TagOperation::WRITE_RAW {
            data_hex: hex::encode([0xAB; 32]),
            key_hex: Some("ffffffffffff".into()),
        });
        let mut session = open(&target);
        ctl.tag_ready(&mut session);
        assert_eq!(target.blocks.lock().unwrap()[0], 0xAB);
        assert!(events.lock().unwrap().iter().any(|e| e.contains("32 bytes")));
    }

    #[test]
    fn encoding_error_reports_without_io() {
        let (mut ctl, events) = controller();
        let target = FakeTarget::ndef_target();
        ctl.set_operation(TagOperation::WRITE_TEXT {
            text: "x".into(),
            language: "a".repeat(64),
        });
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);
        assert!(target.stored.lock().unwrap().is_empty());
        assert!(events.lock().unwrap().iter().any(|e| e.contains("Invalid input")));
    }

    #[test]
    fn vcalendar_operation_parses_datetimes() {
        let (mut ctl, _events) = controller();
        let target = FakeTarget::ndef_target();
        ctl.set_operation(TagOperation::WRITE_VCALENDAR {
            summary: "Meet".into(),
            start: "1998-01-18T23:00:00".into(),
            end: "1998-01-18T23:30:00".into(),
            utc: false,
        });
        let mut session = ndef_session(&target);
        ctl.tag_ready(&mut session);

        let stored = target.stored.lock().unwrap().clone();
        let msg = parse_message(&stored).unwrap();
        let body = String::from_utf8(msg.records()[0].payload.clone()).unwrap();
        assert!(body.contains("DTSTART:19980118T230000"));
        assert!(body.contains("DTEND:19980118T233000"));
    }
}

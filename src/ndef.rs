// src/ndef.rs
use std::str;

use crate::error::TagError;

// Header flag bits: MB | ME | CF | SR | IL | TNF(3)
const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// Type Name Format, the low three bits of the record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tnf {
    Empty = 0x00,
    WellKnown = 0x01,
    Mime = 0x02,
    AbsoluteUri = 0x03,
    External = 0x04,
    Unknown = 0x05,
    Unchanged = 0x06,
}

impl Tnf {
    pub fn from_bits(bits: u8) -> Result<Tnf, TagError> {
        match bits & TNF_MASK {
            0x00 => Ok(Tnf::Empty),
            0x01 => Ok(Tnf::WellKnown),
            0x02 => Ok(Tnf::Mime),
            0x03 => Ok(Tnf::AbsoluteUri),
            0x04 => Ok(Tnf::External),
            0x05 => Ok(Tnf::Unknown),
            0x06 => Ok(Tnf::Unchanged),
            other => Err(TagError::Format(format!("reserved TNF value {other}"))),
        }
    }
}

/// One NDEF record. MB/ME framing is not stored here; the message
/// serializer derives it from record position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(tnf: Tnf, record_type: &[u8], payload: Vec<u8>) -> Record {
        Record {
            tnf,
            record_type: record_type.to_vec(),
            id: None,
            payload,
        }
    }

    /// Well-known record types compare as their ASCII short name ("U", "T", ...).
    pub fn type_name(&self) -> Option<&str> {
        str::from_utf8(&self.record_type).ok()
    }
}

/// An ordered sequence of records. May be empty in memory (the result of
/// reading a blank tag); serialization rejects the empty case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    records: Vec<Record>,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// Appending preserves order; the assembler never reorders.
    pub fn append_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Serialize with standard NDEF framing. MB is set on the first record
    /// and ME on the last; SR is used whenever the payload fits in one
    /// length byte; IL only when an id is present.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TagError> {
        if self.records.is_empty() {
            return Err(TagError::Encoding(
                "cannot serialize a message with no records".into(),
            ));
        }
        let mut out = Vec::new();
        let last = self.records.len() - 1;
        for (i, rec) in self.records.iter().enumerate() {
            encode_record(rec, i == 0, i == last, &mut out)?;
        }
        Ok(out)
    }
}

fn encode_record(rec: &Record, mb: bool, me: bool, out: &mut Vec<u8>) -> Result<(), TagError> {
    if rec.record_type.len() > 255 {
        return Err(TagError::Encoding(format!(
            "record type length {} exceeds 255",
            rec.record_type.len()
        )));
    }
    if let Some(id) = &rec.id {
        if id.len() > 255 {
            return Err(TagError::Encoding(format!(
                "record id length {} exceeds 255",
                id.len()
            )));
        }
    }
    if rec.payload.len() > u32::MAX as usize {
        return Err(TagError::Encoding("payload exceeds 2^32-1 bytes".into()));
    }

    let short = rec.payload.len() <= 255;
    let id = rec.id.as_deref().unwrap_or(&[]);
    let has_id = !id.is_empty();

    let mut header = rec.tnf as u8;
    if mb {
        header |= FLAG_MB;
    }
    if me {
        header |= FLAG_ME;
    }
    if short {
        header |= FLAG_SR;
    }
    if has_id {
        header |= FLAG_IL;
    }

    out.push(header);
    out.push(rec.record_type.len() as u8);
    if short {
        out.push(rec.payload.len() as u8);
    } else {
        out.extend_from_slice(&(rec.payload.len() as u32).to_be_bytes());
    }
    if has_id {
        out.push(id.len() as u8);
    }
    out.extend_from_slice(&rec.record_type);
    if has_id {
        out.extend_from_slice(id);
    }
    out.extend_from_slice(&rec.payload);
    Ok(())
}

/// Parse a serialized NDEF message back into records. Payloads are kept
/// verbatim; no record-type-specific decoding happens here. Walks until
/// the ME flag or the end of the buffer.
pub fn parse_message(data: &[u8]) -> Result<Message, TagError> {
    let mut message = Message::new();
    let mut cursor = 0;

    while cursor < data.len() {
        let header = data[cursor];
        let tnf = Tnf::from_bits(header)?;
        let short = header & FLAG_SR != 0;
        let has_id = header & FLAG_IL != 0;
        let is_me = header & FLAG_ME != 0;
        cursor += 1;

        let type_len = *data.get(cursor).ok_or_else(|| truncated("type length"))? as usize;
        cursor += 1;

        let payload_len = if short {
            let len = *data
                .get(cursor)
                .ok_or_else(|| truncated("payload length"))? as usize;
            cursor += 1;
            len
        } else {
            let bytes = data
                .get(cursor..cursor + 4)
                .ok_or_else(|| truncated("payload length"))?;
            cursor += 4;
            u32::from_be_bytes(bytes.try_into().expect("slice of length 4")) as usize
        };

        let id_len = if has_id {
            let len = *data.get(cursor).ok_or_else(|| truncated("id length"))? as usize;
            cursor += 1;
            len
        } else {
            0
        };

        let record_type = data
            .get(cursor..cursor + type_len)
            .ok_or_else(|| truncated("type field"))?
            .to_vec();
        cursor += type_len;

        let id = if has_id {
            let id = data
                .get(cursor..cursor + id_len)
                .ok_or_else(|| truncated("id field"))?
                .to_vec();
            cursor += id_len;
            Some(id)
        } else {
            None
        };

        let payload = data
            .get(cursor..cursor + payload_len)
            .ok_or_else(|| truncated("payload"))?
            .to_vec();
        cursor += payload_len;

        message.append_record(Record {
            tnf,
            record_type,
            id,
            payload,
        });

        if is_me {
            break;
        }
    }

    Ok(message)
}

fn truncated(what: &str) -> TagError {
    TagError::Format(format!("message truncated in {what}"))
}

/// The NFC Forum URI RTD abbreviation table. Index 0 means no
/// abbreviation; order is wire-significant. `ftp://` appears twice (7/8
/// cover the common forms, 13 is the bare scheme); encoding always picks
/// the lowest matching index, so decoders must accept either.
pub const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Invert the URI record payload: `[prefix index] ++ utf8(remainder)`.
pub fn decode_uri_payload(payload: &[u8]) -> Result<String, TagError> {
    let (&index, rest) = payload
        .split_first()
        .ok_or_else(|| TagError::Format("empty URI payload".into()))?;
    let prefix = URI_PREFIXES
        .get(index as usize)
        .ok_or_else(|| TagError::Format(format!("URI prefix index {index} out of range")))?;
    let remainder = str::from_utf8(rest)
        .map_err(|_| TagError::Format("URI remainder is not valid UTF-8".into()))?;
    Ok(format!("{prefix}{remainder}"))
}

/// Invert the Text record payload: `[status] ++ ascii(lang) ++ utf8(text)`.
/// Returns (text, language).
pub fn decode_text_payload(payload: &[u8]) -> Result<(String, String), TagError> {
    let (&status, rest) = payload
        .split_first()
        .ok_or_else(|| TagError::Format("empty text payload".into()))?;
    if status & 0x80 != 0 {
        return Err(TagError::Format(
            "UTF-16 text records are not supported".into(),
        ));
    }
    let lang_len = (status & 0x3F) as usize;
    if rest.len() < lang_len {
        return Err(TagError::Format(
            "text payload shorter than language tag".into(),
        ));
    }
    let lang = str::from_utf8(&rest[..lang_len])
        .map_err(|_| TagError::Format("language tag is not valid ASCII".into()))?
        .to_string();
    let text = str::from_utf8(&rest[lang_len..])
        .map_err(|_| TagError::Format("text body is not valid UTF-8".into()))?
        .to_string();
    Ok((text, lang))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wkt(name: &str, payload: &[u8]) -> Record {
        Record::new(Tnf::WellKnown, name.as_bytes(), payload.to_vec())
    }

    #[test]
    fn single_record_sets_mb_and_me() {
        let mut msg = Message::new();
        msg.append_record(wkt("T", &[0x02, b'e', b'n']));
        let bytes = msg.to_bytes().unwrap();
        // MB | ME | SR | TNF=1
        assert_eq!(bytes[0], 0xD1);
        assert_eq!(bytes[1], 1); // type length
        assert_eq!(bytes[2], 3); // payload length
        assert_eq!(bytes[3], b'T');
    }

    #[test]
    fn interior_records_clear_both_flags() {
        let mut msg = Message::new();
        msg.append_record(wkt("U", &[0x00]));
        msg.append_record(wkt("T", &[0x00]));
        msg.append_record(wkt("U", &[0x00]));
        let bytes = msg.to_bytes().unwrap();
        let parsed = parse_message(&bytes).unwrap();
        assert_eq!(parsed.len(), 3);
        // each record is 5 bytes: header, type len, payload len, type, payload(0)... payload is 1 byte here
        assert_eq!(bytes[0] & 0xC0, 0x80);
        assert_eq!(bytes[5] & 0xC0, 0x00);
        assert_eq!(bytes[10] & 0xC0, 0x40);
    }

    #[test]
    fn empty_message_is_rejected() {
        let err = Message::new().to_bytes().unwrap_err();
        assert!(matches!(err, TagError::Encoding(_)));
    }

    #[test]
    fn long_payload_uses_four_byte_length() {
        let mut msg = Message::new();
        msg.append_record(wkt("U", &vec![0xAB; 300]));
        let bytes = msg.to_bytes().unwrap();
        // SR must be clear
        assert_eq!(bytes[0] & 0x10, 0x00);
        assert_eq!(&bytes[2..6], &300u32.to_be_bytes());
        let parsed = parse_message(&bytes).unwrap();
        assert_eq!(parsed.records()[0].payload.len(), 300);
    }

    #[test]
    fn id_round_trips_with_il_flag() {
        let mut rec = wkt("U", &[0x00, b'x']);
        rec.id = Some(b"id1".to_vec());
        let mut msg = Message::new();
        msg.append_record(rec.clone());
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[0] & 0x08, 0x08);
        let parsed = parse_message(&bytes).unwrap();
        assert_eq!(parsed.records()[0], rec);
    }

    #[test]
    fn oversized_id_is_rejected() {
        let mut rec = wkt("U", &[0x00]);
        rec.id = Some(vec![0u8; 256]);
        let mut msg = Message::new();
        msg.append_record(rec);
        assert!(matches!(msg.to_bytes(), Err(TagError::Encoding(_))));
    }

    #[test]
    fn parse_stops_at_me_flag() {
        let mut msg = Message::new();
        msg.append_record(wkt("T", &[0x00]));
        let mut bytes = msg.to_bytes().unwrap();
        bytes.extend_from_slice(&[0xFE, 0xFE, 0xFE]); // trailing junk after ME
        let parsed = parse_message(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn truncated_message_is_a_format_error() {
        let mut msg = Message::new();
        msg.append_record(wkt("T", &[0x02, b'e', b'n', b'h', b'i']));
        let bytes = msg.to_bytes().unwrap();
        let err = parse_message(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, TagError::Format(_)));
    }

    #[test]
    fn message_round_trip() {
        let mut msg = Message::new();
        msg.append_record(wkt(
            "U",
            &[0x03, b'n', b'o', b'k', b'i', b'a', b'.', b'c', b'o', b'm'],
        ));
        msg.append_record(wkt("T", &[0x02, b'e', b'n', b'N', b'o', b'k', b'i', b'a']));
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(parse_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn uri_payload_decoder_applies_prefix() {
        let uri = decode_uri_payload(&[
            0x03, b'n', b'o', b'k', b'i', b'a', b'.', b'c', b'o', b'm', b'/',
        ])
        .unwrap();
        assert_eq!(uri, "http://nokia.com/");
    }

    #[test]
    fn text_payload_decoder_splits_lang_and_text() {
        let (text, lang) =
            decode_text_payload(&[0x02, b'e', b'n', b'N', b'o', b'k', b'i', b'a']).unwrap();
        assert_eq!(text, "Nokia");
        assert_eq!(lang, "en");
    }

    #[test]
    fn utf16_text_payload_is_rejected() {
        let err = decode_text_payload(&[0x82, b'e', b'n']).unwrap_err();
        assert!(matches!(err, TagError::Format(_)));
    }
}

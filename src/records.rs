// src/records.rs
//
// Pure constructors for the record types the service can write. None of
// these perform I/O; invalid input is reported as TagError::Encoding.

use jiff::civil::DateTime;
use log::warn;

use crate::error::TagError;
use crate::ndef::{Message, Record, Tnf, URI_PREFIXES};

/// Suggested reader behaviour for a Smart Poster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    Execute = 0,
    Save = 1,
    Edit = 2,
}

/// Which URI to render for a pair of WGS-84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoStyle {
    /// `geo:` URI scheme (RFC 5870 subset, no altitude/uncertainty).
    GeoUri,
    /// Nokia Maps redirect link.
    OviMaps,
    /// Generic redirect via nfcinteractor.com.
    NfcInteractor,
}

/// Optional parts of a Smart Poster, appended in this fixed order:
/// URI, title, action, image.
#[derive(Debug, Clone, Default)]
pub struct SmartPosterParts {
    pub uri: Option<String>,
    /// Title text; written with language tag "en".
    pub title: Option<String>,
    pub action: Option<ActionKind>,
    /// Image bytes together with the filename the MIME type is taken from.
    pub image: Option<(Vec<u8>, String)>,
}

/// URI record (well-known type "U"). The lowest-index matching entry of
/// the abbreviation table is substituted by its one-byte index; index 0
/// plus the whole URI is written when nothing matches.
pub fn uri_record(full_uri: &str) -> Result<Record, TagError> {
    if full_uri.is_empty() {
        return Err(TagError::Encoding("URI must not be empty".into()));
    }
    let mut payload = vec![0u8];
    let mut remainder = full_uri;
    for (i, prefix) in URI_PREFIXES.iter().enumerate().skip(1) {
        if full_uri.starts_with(prefix) {
            payload[0] = i as u8;
            remainder = &full_uri[prefix.len()..];
            break;
        }
    }
    payload.extend_from_slice(remainder.as_bytes());
    Ok(Record::new(Tnf::WellKnown, b"U", payload))
}

/// Text record (well-known type "T"). UTF-8 only, so the status byte is
/// just the language tag length (high bit clear).
pub fn text_record(text: &str, language: &str) -> Result<Record, TagError> {
    if !language.is_ascii() {
        return Err(TagError::Encoding(format!(
            "language tag {language:?} is not ASCII"
        )));
    }
    if language.len() > 63 {
        return Err(TagError::Encoding(format!(
            "language tag length {} exceeds 63",
            language.len()
        )));
    }
    let mut payload = vec![(language.len() & 0x3F) as u8];
    payload.extend_from_slice(language.as_bytes());
    payload.extend_from_slice(text.as_bytes());
    Ok(Record::new(Tnf::WellKnown, b"T", payload))
}

/// Action sub-record (well-known type "act"), a Smart Poster child.
pub fn action_record(action: ActionKind) -> Record {
    Record::new(Tnf::WellKnown, b"act", vec![action as u8])
}

/// MIME image record. The type is picked from the filename extension;
/// unrecognized extensions are refused rather than written with an empty
/// MIME type.
pub fn image_record(data: &[u8], filename: &str) -> Result<Record, TagError> {
    if data.is_empty() {
        return Err(TagError::Encoding("image data must not be empty".into()));
    }
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let mime: &[u8] = match ext.as_str() {
        "png" => b"image/png",
        "jpg" | "jpeg" => b"image/jpeg",
        "gif" => b"image/gif",
        _ => {
            warn!("unrecognized image file type: {filename}");
            return Err(TagError::Encoding(format!(
                "unrecognized image file type: {filename}"
            )));
        }
    };
    Ok(Record::new(Tnf::Mime, mime, data.to_vec()))
}

/// Geo record: a URI record for the given coordinates. Coordinates are
/// rendered with Rust's default f64 formatting, which is
/// locale-independent with a `.` separator.
pub fn geo_record(latitude: f64, longitude: f64, style: GeoStyle) -> Result<Record, TagError> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(TagError::Encoding(
            "coordinates must be finite numbers".into(),
        ));
    }
    let uri = match style {
        GeoStyle::GeoUri => format!("geo:{latitude},{longitude}"),
        GeoStyle::OviMaps => format!("http://m.ovi.me/?c={latitude},{longitude}"),
        GeoStyle::NfcInteractor => {
            format!("http://nfcinteractor.com/m?c={latitude},{longitude}")
        }
    };
    uri_record(&uri)
}

/// External-type record. The type is emitted exactly as given; both the
/// full `urn:nfc:ext:example.com:foo` form and the bare domain-scoped
/// form are accepted.
pub fn external_record(type_uri: &str, payload: &[u8]) -> Result<Record, TagError> {
    if type_uri.is_empty() {
        return Err(TagError::Encoding("external type must not be empty".into()));
    }
    Ok(Record::new(
        Tnf::External,
        type_uri.as_bytes(),
        payload.to_vec(),
    ))
}

/// vCalendar event record, MIME type `text/x-vCalendar`. The default
/// character set for iCalendar (RFC 2445) is UTF-8.
pub fn vcalendar_record(
    summary: &str,
    start: DateTime,
    end: DateTime,
    utc: bool,
) -> Result<Record, TagError> {
    let body = format!(
        "BEGIN:VCALENDAR\nVERSION:1.0\nBEGIN:VEVENT\nDTSTART:{}\nDTEND:{}\nSUMMARY:{}\nEND:VEVENT\nEND:VCALENDAR",
        vcal_time(start, utc),
        vcal_time(end, utc),
        summary
    );
    Ok(Record::new(
        Tnf::Mime,
        b"text/x-vCalendar",
        body.into_bytes(),
    ))
}

/// `YYYYMMDDThhmmss`, with a capital `Z` suffix for UTC times. Other time
/// zone notations are not emitted (an explicit UTC offset is invalid in
/// vCalendar).
fn vcal_time(t: DateTime, utc: bool) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}{}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        if utc { "Z" } else { "" }
    )
}

/// Smart Poster record (well-known type "Sp"): the selected parts are
/// assembled into a fresh inner message whose serialized bytes become the
/// outer payload. Inner framing is independent of the outer message.
pub fn smart_poster_record(parts: &SmartPosterParts) -> Result<Record, TagError> {
    let mut inner = Message::new();
    if let Some(uri) = &parts.uri {
        inner.append_record(uri_record(uri)?);
    }
    if let Some(title) = &parts.title {
        inner.append_record(text_record(title, "en")?);
    }
    if let Some(action) = parts.action {
        inner.append_record(action_record(action));
    }
    if let Some((data, filename)) = &parts.image {
        inner.append_record(image_record(data, filename)?);
    }
    if inner.is_empty() {
        return Err(TagError::Encoding(
            "smart poster needs at least one part".into(),
        ));
    }
    Ok(Record::new(Tnf::WellKnown, b"Sp", inner.to_bytes()?))
}

/// SMS record: `sms:{number}?body={body}`. Plain URI record when neither
/// title nor action is requested, otherwise a Smart Poster wrapping the
/// SMS URI.
pub fn sms_record(
    number: &str,
    body: &str,
    title: Option<&str>,
    action: Option<ActionKind>,
) -> Result<Record, TagError> {
    if number.is_empty() {
        return Err(TagError::Encoding("sms number must not be empty".into()));
    }
    let sms_uri = format!("sms:{number}?body={body}");
    if title.is_none() && action.is_none() {
        return uri_record(&sms_uri);
    }
    smart_poster_record(&SmartPosterParts {
        uri: Some(sms_uri),
        title: title.map(str::to_string),
        action,
        image: None,
    })
}

/// An empty record (TNF 0, no type, no payload), used to blank a tag.
pub fn empty_record() -> Record {
    Record::new(Tnf::Empty, b"", Vec::new())
}

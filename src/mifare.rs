// src/mifare.rs
//
// Tag-technology-specific block I/O: the raw Mifare Classic adapter and
// the TLV-wrapped NDEF channel used for both Classic and NTAG targets.

use log::{info, warn};
use pcsc::Card;

use crate::apdu;
use crate::error::TagError;
use crate::session::{MifareKey, NdefChannel, RawTag};

const BLOCK_SIZE: usize = 16;
const CLASSIC_SECTORS: usize = 16;
const CLASSIC_BLOCKS: usize = 64;
const NTAG_PAGE_SIZE: usize = 4;
/// Usable NDEF area of an NTAG215.
const NTAG_DATA_BYTES: usize = 504;

/// Well-known sector keys tried for the NDEF-over-Classic path, transport
/// key and NFC Forum MAD key first.
pub const COMMON_KEYS: [MifareKey; 8] = [
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5],
    [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5],
    [0x4D, 0x3A, 0x99, 0xC3, 0x51, 0xDD],
    [0x1A, 0x98, 0x2C, 0x7E, 0x45, 0x9A],
    [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
];

fn is_trailer(block: usize) -> bool {
    (block + 1) % 4 == 0
}

/// Wrap a serialized NDEF message in the tag container TLV:
/// T = 0x03, one- or three-byte L, value, 0xFE terminator.
pub fn wrap_in_tlv(ndef_bytes: &[u8]) -> Result<Vec<u8>, TagError> {
    if ndef_bytes.len() > 0xFFFF {
        return Err(TagError::Overflow(format!(
            "NDEF message of {} bytes does not fit a tag TLV",
            ndef_bytes.len()
        )));
    }
    let mut tlv = vec![0x03];
    if ndef_bytes.len() < 255 {
        tlv.push(ndef_bytes.len() as u8);
    } else {
        tlv.push(0xFF);
        tlv.extend_from_slice(&(ndef_bytes.len() as u16).to_be_bytes());
    }
    tlv.extend_from_slice(ndef_bytes);
    tlv.push(0xFE);
    Ok(tlv)
}

/// Find the NDEF TLV in raw tag memory and return the contained message
/// bytes. A tag without the container reads as an empty message.
pub fn extract_tlv(buffer: &[u8]) -> Vec<u8> {
    let Some(start) = buffer.iter().position(|&b| b == 0x03) else {
        return Vec::new();
    };
    let Some(&len_byte) = buffer.get(start + 1) else {
        return Vec::new();
    };
    let (len, data_start) = if len_byte == 0xFF {
        let Some(bytes) = buffer.get(start + 2..start + 4) else {
            return Vec::new();
        };
        (
            u16::from_be_bytes(bytes.try_into().expect("slice of length 2")) as usize,
            start + 4,
        )
    } else {
        (len_byte as usize, start + 2)
    };
    buffer
        .get(data_start..data_start + len)
        .map(<[u8]>::to_vec)
        .unwrap_or_default()
}

/// Which block-layout the connected card uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Classic1k,
    Ntag,
}

/// NDEF channel over block-oriented storage cards: the message travels
/// inside a TLV container starting at block/page 4.
pub struct TlvNdefChannel {
    card: Card,
    kind: CardKind,
}

impl TlvNdefChannel {
    pub fn new(card: Card, kind: CardKind) -> TlvNdefChannel {
        TlvNdefChannel { card, kind }
    }

    /// Authenticate the sector containing `block`, trying the well-known
    /// keys with both key slots.
    fn auth_classic_sector(&self, block: u8) -> Result<(), TagError> {
        for key in COMMON_KEYS.iter() {
            if apdu::load_key(&self.card, key).is_ok()
                && (apdu::authenticate(&self.card, block, apdu::KEY_TYPE_A).is_ok()
                    || apdu::authenticate(&self.card, block, apdu::KEY_TYPE_B).is_ok())
            {
                return Ok(());
            }
        }
        Err(TagError::Auth(format!(
            "no known key opens the sector at block {block}"
        )))
    }

    fn read_classic(&self) -> Result<Vec<u8>, TagError> {
        let mut raw = Vec::new();
        let mut expected: Option<usize> = None;

        // Sector 0 holds the manufacturer block and MAD, the message
        // starts in sector 1.
        for block in 4..CLASSIC_BLOCKS {
            if is_trailer(block) {
                continue;
            }
            if block % 4 == 0 {
                if let Err(err) = self.auth_classic_sector(block as u8) {
                    // Can't get further into the tag; whatever was read so
                    // far is all there is.
                    warn!("stopping classic read: {err}");
                    break;
                }
            }
            raw.extend_from_slice(&apdu::read_binary(&self.card, block as u8, BLOCK_SIZE as u8)?);

            if expected.is_none() {
                if let Some(pos) = raw.iter().position(|&b| b == 0x03) {
                    if raw.len() > pos + 1 {
                        expected = Some(pos + 2 + raw[pos + 1] as usize);
                    }
                }
            }
            if expected.is_some_and(|end| raw.len() >= end + 1) {
                break;
            }
        }
        Ok(raw)
    }

    fn read_ntag(&self) -> Result<Vec<u8>, TagError> {
        let mut raw = Vec::new();
        let pages = NTAG_DATA_BYTES / NTAG_PAGE_SIZE;
        for page in 4..4 + pages {
            match apdu::read_binary(&self.card, page as u8, NTAG_PAGE_SIZE as u8) {
                Ok(data) => raw.extend_from_slice(&data),
                // Past the end of the card; keep what was read.
                Err(_) => break,
            }
            // Stop early once the full TLV is in the buffer.
            if raw.first() == Some(&0x03) && raw.len() >= 2 {
                let end = if raw[1] == 0xFF {
                    if raw.len() < 4 {
                        continue;
                    }
                    4 + u16::from_be_bytes([raw[2], raw[3]]) as usize
                } else {
                    2 + raw[1] as usize
                };
                if raw.len() >= end + 1 {
                    break;
                }
            }
        }
        Ok(raw)
    }

    fn write_classic(&self, tlv: &[u8]) -> Result<(), TagError> {
        let capacity = (4..CLASSIC_BLOCKS).filter(|&b| !is_trailer(b)).count() * BLOCK_SIZE;
        if tlv.len() > capacity {
            return Err(TagError::Overflow(format!(
                "message TLV of {} bytes exceeds tag capacity {capacity}",
                tlv.len()
            )));
        }
        let mut offset = 0;
        let mut block = 4;
        while offset < tlv.len() {
            if is_trailer(block) {
                block += 1;
                continue;
            }
            if block % 4 == 0 {
                self.auth_classic_sector(block as u8)?;
            }
            let mut chunk = [0u8; BLOCK_SIZE];
            let copy_len = BLOCK_SIZE.min(tlv.len() - offset);
            chunk[..copy_len].copy_from_slice(&tlv[offset..offset + copy_len]);
            apdu::update_binary(&self.card, block as u8, &chunk)?;
            offset += BLOCK_SIZE;
            block += 1;
        }
        Ok(())
    }

    fn write_ntag(&self, tlv: &[u8]) -> Result<(), TagError> {
        if tlv.len() > NTAG_DATA_BYTES {
            return Err(TagError::Overflow(format!(
                "message TLV of {} bytes exceeds tag capacity {NTAG_DATA_BYTES}",
                tlv.len()
            )));
        }
        let mut padded = tlv.to_vec();
        while padded.len() % NTAG_PAGE_SIZE != 0 {
            padded.push(0x00);
        }
        for (i, chunk) in padded.chunks(NTAG_PAGE_SIZE).enumerate() {
            apdu::update_binary(&self.card, (4 + i) as u8, chunk)?;
        }
        Ok(())
    }
}

impl NdefChannel for TlvNdefChannel {
    fn read_ndef(&mut self) -> Result<Vec<u8>, TagError> {
        let raw = match self.kind {
            CardKind::Classic1k => self.read_classic()?,
            CardKind::Ntag => self.read_ntag()?,
        };
        Ok(extract_tlv(&raw))
    }

    fn write_ndef(&mut self, bytes: &[u8]) -> Result<(), TagError> {
        let tlv = wrap_in_tlv(bytes)?;
        match self.kind {
            CardKind::Classic1k => self.write_classic(&tlv),
            CardKind::Ntag => self.write_ntag(&tlv),
        }
    }
}

/// Raw block adapter for Mifare Classic 1K: 16 sectors of 4 blocks of 16
/// bytes, authenticated per sector with one caller-supplied key.
pub struct MifareTag {
    card: Card,
}

impl MifareTag {
    pub fn new(card: Card) -> MifareTag {
        MifareTag { card }
    }

    fn auth_sector(&self, block: u8, key: &MifareKey) -> Result<(), TagError> {
        apdu::load_key(&self.card, key)?;
        if apdu::authenticate(&self.card, block, apdu::KEY_TYPE_A).is_ok() {
            return Ok(());
        }
        apdu::authenticate(&self.card, block, apdu::KEY_TYPE_B)
    }
}

impl RawTag for MifareTag {
    fn sector_count(&self) -> usize {
        CLASSIC_SECTORS
    }

    fn block_count(&self) -> usize {
        CLASSIC_BLOCKS
    }

    fn size_bytes(&self) -> usize {
        CLASSIC_BLOCKS * BLOCK_SIZE
    }

    fn read(
        &mut self,
        key: &MifareKey,
        dst: &mut [u8],
        start_block: usize,
        start_byte: usize,
    ) -> Result<usize, TagError> {
        let size = self.size_bytes();
        let offset = start_block * BLOCK_SIZE + start_byte;
        if offset >= size {
            return Err(TagError::Config(format!(
                "read offset {offset} past tag size {size}"
            )));
        }
        let length = dst.len().min(size - offset);
        let mut copied = 0;
        let mut block = offset / BLOCK_SIZE;
        let mut in_block = offset % BLOCK_SIZE;
        let mut authed_sector = None;
        while copied < length {
            if authed_sector != Some(block / 4) {
                self.auth_sector(block as u8, key)?;
                authed_sector = Some(block / 4);
            }
            let data = apdu::read_binary(&self.card, block as u8, BLOCK_SIZE as u8)?;
            let take = (BLOCK_SIZE - in_block).min(length - copied);
            dst[copied..copied + take].copy_from_slice(&data[in_block..in_block + take]);
            copied += take;
            in_block = 0;
            block += 1;
        }
        info!("read {copied} bytes from raw tag");
        Ok(copied)
    }

    fn write(&mut self, key: &MifareKey, src: &[u8], start_block: usize) -> Result<(), TagError> {
        if start_block * BLOCK_SIZE + src.len() > self.size_bytes() {
            return Err(TagError::Overflow(format!(
                "{} bytes from block {start_block} exceed tag size {}",
                src.len(),
                self.size_bytes()
            )));
        }
        // The manufacturer block is read-only and the sector trailers
        // hold keys and access bits; both are skipped, the image layout
        // is preserved by advancing the source offset regardless.
        let mut authed_sector = None;
        for (i, chunk) in src.chunks(BLOCK_SIZE).enumerate() {
            let block = start_block + i;
            if block == 0 || is_trailer(block) {
                continue;
            }
            if authed_sector != Some(block / 4) {
                self.auth_sector(block as u8, key)?;
                authed_sector = Some(block / 4);
            }
            let mut padded = [0u8; BLOCK_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            apdu::update_binary(&self.card, block as u8, &padded)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_short_form() {
        let tlv = wrap_in_tlv(&[0xD1, 0x01, 0x00, b'T']).unwrap();
        assert_eq!(tlv[0], 0x03);
        assert_eq!(tlv[1], 4);
        assert_eq!(*tlv.last().unwrap(), 0xFE);
        assert_eq!(extract_tlv(&tlv), [0xD1, 0x01, 0x00, b'T']);
    }

    #[test]
    fn tlv_long_form() {
        let msg = vec![0xAA; 300];
        let tlv = wrap_in_tlv(&msg).unwrap();
        assert_eq!(tlv[1], 0xFF);
        assert_eq!(u16::from_be_bytes([tlv[2], tlv[3]]), 300);
        assert_eq!(extract_tlv(&tlv), msg);
    }

    #[test]
    fn extract_without_container_is_empty() {
        assert!(extract_tlv(&[0x00, 0x00, 0xFE]).is_empty());
        assert!(extract_tlv(&[]).is_empty());
    }

    #[test]
    fn extract_ignores_leading_lock_bytes() {
        let mut raw = vec![0x01, 0x02];
        raw.extend_from_slice(&wrap_in_tlv(&[0xD1, 0x00, 0x00]).unwrap());
        assert_eq!(extract_tlv(&raw), [0xD1, 0x00, 0x00]);
    }

    #[test]
    fn trailer_blocks() {
        assert!(is_trailer(3));
        assert!(is_trailer(63));
        assert!(!is_trailer(4));
    }
}

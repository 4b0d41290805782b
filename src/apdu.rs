// src/apdu.rs
//
// Contactless storage-card pseudo-APDUs (ACR122U convention). All calls
// go through a single transmit helper that checks the 0x9000 status word.

use pcsc::Card;

use crate::error::TagError;
use crate::session::MifareKey;

pub const KEY_TYPE_A: u8 = 0x60;
pub const KEY_TYPE_B: u8 = 0x61;

fn transmit(card: &Card, apdu: &[u8], what: &str) -> Result<Vec<u8>, TagError> {
    let mut recv_buffer = [0u8; 256];
    let resp = card
        .transmit(apdu, &mut recv_buffer)
        .map_err(TagError::from_pcsc)?;
    if resp.len() >= 2 && resp[resp.len() - 2] == 0x90 && resp[resp.len() - 1] == 0x00 {
        Ok(resp[..resp.len() - 2].to_vec())
    } else {
        Err(TagError::Transport(format!("{what} failed: {resp:02X?}")))
    }
}

/// Load an authentication key into reader volatile memory (slot 0).
/// FF 82 00 00 06 [KEY]
pub fn load_key(card: &Card, key: &MifareKey) -> Result<(), TagError> {
    let mut apdu = vec![0xFF, 0x82, 0x00, 0x00, 0x06];
    apdu.extend_from_slice(key);
    transmit(card, &apdu, "load key").map(|_| ())
}

/// Authenticate one block with the previously loaded key.
/// FF 86 00 00 05 01 00 Block KeyType 00
pub fn authenticate(card: &Card, block: u8, key_type: u8) -> Result<(), TagError> {
    let apdu = [
        0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, block, key_type, 0x00,
    ];
    transmit(card, &apdu, "authenticate")
        .map(|_| ())
        .map_err(|_| TagError::Auth(format!("block {block} rejected the key")))
}

/// Read `length` bytes from a block. FF B0 00 Block Len
pub fn read_binary(card: &Card, block: u8, length: u8) -> Result<Vec<u8>, TagError> {
    let apdu = [0xFF, 0xB0, 0x00, block, length];
    transmit(card, &apdu, "read binary")
}

/// Write one block (or page). FF D6 00 Block Len [Data]
pub fn update_binary(card: &Card, block: u8, data: &[u8]) -> Result<(), TagError> {
    let mut apdu = vec![0xFF, 0xD6, 0x00, block, data.len() as u8];
    apdu.extend_from_slice(data);
    transmit(card, &apdu, "update binary").map(|_| ())
}

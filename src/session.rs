// src/session.rs
use log::warn;

use crate::error::TagError;
use crate::ndef::{Message, parse_message};

/// Mifare authentication key. The all-0xFF transport key is the factory
/// default.
pub type MifareKey = [u8; 6];
pub const DEFAULT_KEY: MifareKey = [0xFF; 6];

/// Connection kind requested by the controller for the next touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Ndef,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connected,
    Reading,
    Writing,
    Closed,
}

/// An NDEF-capable connection to a tag: whole serialized messages in and
/// out, no framing knowledge.
pub trait NdefChannel: Send {
    fn read_ndef(&mut self) -> Result<Vec<u8>, TagError>;
    fn write_ndef(&mut self, bytes: &[u8]) -> Result<(), TagError>;
}

/// Block-oriented access to a tag under key authentication.
pub trait RawTag: Send {
    fn sector_count(&self) -> usize;
    fn block_count(&self) -> usize;
    /// Total dump size: `block_count * 16`.
    fn size_bytes(&self) -> usize;
    /// Fill `dst` starting at the given block/byte offset. Returns the
    /// number of bytes read.
    fn read(
        &mut self,
        key: &MifareKey,
        dst: &mut [u8],
        start_block: usize,
        start_byte: usize,
    ) -> Result<usize, TagError>;
    fn write(&mut self, key: &MifareKey, src: &[u8], start_block: usize) -> Result<(), TagError>;
}

/// One discovery candidate: a target in range that may be opened either
/// way. Implemented by the PC/SC platform and by test fakes.
pub trait Target: Send {
    fn supports_ndef(&self) -> bool;
    /// Technology identifier, matched against the configured raw-adapter
    /// token in raw mode.
    fn connection_name(&self) -> &str;
    fn open_ndef(&self) -> Result<Box<dyn NdefChannel>, TagError>;
    fn open_raw(&self) -> Result<Box<dyn RawTag>, TagError>;
}

enum Handle {
    Ndef(Box<dyn NdefChannel>),
    Raw(Box<dyn RawTag>),
}

/// Per-touch session state. At most one live handle; every I/O error
/// closes the session before the error is returned, so a session is never
/// left half-open.
pub struct TagSession {
    mode: ConnectionMode,
    phase: Phase,
    handle: Option<Handle>,
}

impl std::fmt::Debug for TagSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagSession")
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl TagSession {
    /// Scan the candidates for one compatible with the requested mode and
    /// open it. In raw mode only targets whose connection name equals
    /// `raw_token` qualify.
    pub fn open(
        targets: &[Box<dyn Target>],
        mode: ConnectionMode,
        raw_token: &str,
    ) -> Result<TagSession, TagError> {
        if targets.is_empty() {
            return Err(TagError::Config("no target candidates".into()));
        }
        let handle = match mode {
            ConnectionMode::Ndef => {
                let target = targets
                    .iter()
                    .find(|t| t.supports_ndef())
                    .ok_or_else(|| TagError::Config("no NDEF-capable target in range".into()))?;
                Handle::Ndef(target.open_ndef()?)
            }
            ConnectionMode::Raw => {
                let target = targets
                    .iter()
                    .find(|t| t.connection_name() == raw_token)
                    .ok_or_else(|| {
                        TagError::Config(format!("no target with raw connection {raw_token}"))
                    })?;
                Handle::Raw(target.open_raw()?)
            }
        };
        Ok(TagSession {
            mode,
            phase: Phase::Connected,
            handle: Some(handle),
        })
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Read the tag's NDEF message. Unreadable or empty content yields an
    /// empty record set, not an error; only transport failures fail (and
    /// close the session).
    pub fn read_ndef(&mut self) -> Result<Message, TagError> {
        self.ndef_handle()?;
        self.phase = Phase::Reading;
        let result = match &mut self.handle {
            Some(Handle::Ndef(channel)) => channel.read_ndef(),
            _ => unreachable!("handle checked above"),
        };
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail(err)),
        };
        self.phase = Phase::Connected;
        match parse_message(&bytes) {
            Ok(message) => Ok(message),
            Err(err) => {
                warn!("tag content unreadable, treating as empty: {err}");
                Ok(Message::new())
            }
        }
    }

    /// Serialize and write a message. Encoding problems surface before
    /// any I/O and leave the session connected.
    pub fn write_ndef(&mut self, message: &Message) -> Result<(), TagError> {
        let bytes = message.to_bytes()?;
        self.ndef_handle()?;
        self.phase = Phase::Writing;
        let result = match &mut self.handle {
            Some(Handle::Ndef(channel)) => channel.write_ndef(&bytes),
            _ => unreachable!("handle checked above"),
        };
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        self.phase = Phase::Connected;
        Ok(())
    }

    /// Read the full raw dump, authenticating with `key` (default key
    /// when none is supplied).
    pub fn read_raw(&mut self, key: Option<MifareKey>) -> Result<Vec<u8>, TagError> {
        let tag = self.raw_handle()?;
        let key = key.unwrap_or(DEFAULT_KEY);
        let mut dump = vec![0u8; tag.size_bytes()];
        self.phase = Phase::Reading;
        let result = match &mut self.handle {
            Some(Handle::Raw(tag)) => tag.read(&key, &mut dump, 0, 0),
            _ => unreachable!("handle checked above"),
        };
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        self.phase = Phase::Connected;
        Ok(dump)
    }

    /// Write a raw dump starting at block 0.
    pub fn write_raw(&mut self, data: &[u8], key: Option<MifareKey>) -> Result<(), TagError> {
        let tag = self.raw_handle()?;
        if data.len() > tag.size_bytes() {
            return Err(TagError::Overflow(format!(
                "dump of {} bytes exceeds tag size {}",
                data.len(),
                tag.size_bytes()
            )));
        }
        let key = key.unwrap_or(DEFAULT_KEY);
        self.phase = Phase::Writing;
        let result = match &mut self.handle {
            Some(Handle::Raw(tag)) => tag.write(&key, data, 0),
            _ => unreachable!("handle checked above"),
        };
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        self.phase = Phase::Connected;
        Ok(())
    }

    /// Drop the handle. Safe to call on any phase, and called from every
    /// error path.
    pub fn close(&mut self) {
        self.handle = None;
        self.phase = Phase::Closed;
    }

    /// Transition to Closed and hand the error back.
    fn fail(&mut self, err: TagError) -> TagError {
        self.close();
        err
    }

    fn ndef_handle(&mut self) -> Result<&mut Box<dyn NdefChannel>, TagError> {
        if self.phase != Phase::Connected {
            return Err(TagError::Config(format!(
                "operation requires a connected session (phase {:?})",
                self.phase
            )));
        }
        match &mut self.handle {
            Some(Handle::Ndef(channel)) => Ok(channel),
            _ => Err(TagError::Config(
                "NDEF operation requested on a raw-mode session".into(),
            )),
        }
    }

    fn raw_handle(&mut self) -> Result<&mut Box<dyn RawTag>, TagError> {
        if self.phase != Phase::Connected {
            return Err(TagError::Config(format!(
                "operation requires a connected session (phase {:?})",
                self.phase
            )));
        }
        match &mut self.handle {
            Some(Handle::Raw(tag)) => Ok(tag),
            _ => Err(TagError::Config(
                "raw operation requested on an NDEF-mode session".into(),
            )),
        }
    }
}

impl Drop for TagSession {
    fn drop(&mut self) {
        self.close();
    }
}

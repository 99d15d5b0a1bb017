//! The message envelope exchanged between services.

use crate::handle::Handle;

/// Correlation id used to match replies to requests. `0` means "fire and forget".
pub type Session = u32;

/// 24-bit space a [`Session`] lives in; session allocation wraps here, skipping 0.
pub const SESSION_MASK: u32 = 0x00FF_FFFF;

/// Largest payload a message can carry: skynet packs the byte count into the low 24 bits of
/// its combined `type_and_size` field (spec §3), so `2^24 - 1` is the largest length that
/// field can ever represent, independent of however this crate actually stores the bytes.
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

/// Protocol tag identifying how a message's payload should be interpreted.
///
/// skynet calls this field `type`; it is kept as its own enum rather than packed into the
/// high byte of a combined `type_and_size` integer (see SPEC_FULL.md §3) because Rust has no
/// need for that C-struct packing trick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Plain application text/bytes.
    Text,
    /// Runtime-internal control message (exit requests, log-reopen, …).
    System,
    /// A reply to a previous request.
    Response,
    /// An error report, usually routed back to the sender.
    Error,
    /// A timer-injected timeout notification.
    Timeout,
    /// Application-defined tag outside the built-in set.
    Custom(u8),
}

impl MessageType {
    /// Whether a `send` with `session == 0` under this tag should mint a fresh session.
    ///
    /// Mirrors the "allocate session" tag bit in spec §4.4: requests want a fresh
    /// correlation id, one-way notifications and system/timeout messages don't.
    pub fn allocates_session(self) -> bool {
        matches!(self, MessageType::Text | MessageType::Custom(_))
    }
}

/// One entry in a mailbox.
#[derive(Debug, Clone)]
pub struct Message {
    pub source: Handle,
    pub session: Session,
    pub type_: MessageType,
    pub payload: Option<Vec<u8>>,
}

impl Message {
    pub fn system(session: Session, type_: MessageType) -> Self {
        Message {
            source: Handle::SYSTEM,
            session,
            type_,
            payload: None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Telegram layout and byte-level wire rules for the bus.
//!
//! A master telegram is `QQ ZZ PB SB NN payload… CRC`; a slave reply is
//! `ACK NN payload… CRC`. The checksum is CRC-8 over the unescaped frame
//! bytes preceding it; a reply's opening ACK is not covered, its CRC
//! spans only `NN payload…`. The sync byte and the escape byte never
//! appear raw inside a frame: they are replaced on the wire by two-byte
//! escape sequences and restored on receipt.

use heapless::Vec as BoundedVec;

/// Sync marker separating telegrams on an idle bus.
pub const SYN: u8 = 0xAA;
/// Escape marker for in-frame occurrences of `SYN`/`ESC`.
pub const ESC: u8 = 0xA9;
/// Positive acknowledge opening a slave reply.
pub const ACK: u8 = 0x00;
/// Negative acknowledge; treated as no valid reply.
pub const NAK: u8 = 0xFF;
/// Destination address reaching every participant; no reply follows.
pub const BROADCAST_ADDR: u8 = 0xFE;

/// Payloads on this bus family never exceed 16 data bytes.
pub const MAX_PAYLOAD: usize = 16;

pub type Payload = BoundedVec<u8, MAX_PAYLOAD>;

const CRC_POLY: u8 = 0x9B;

/// CRC-8 over the unescaped frame bytes, polynomial 0x9B.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in bytes {
        let mut b = byte;
        for _ in 0..8 {
            let carry = (crc & 0x80) != 0;
            crc <<= 1;
            if carry {
                crc ^= CRC_POLY;
            }
            if (b & 0x80) != 0 {
                crc ^= 0x01;
            }
            b <<= 1;
        }
    }
    crc
}

/// Appends `byte` to `out`, escaping `SYN`/`ESC` per the wire rules.
pub fn escape_into(out: &mut std::vec::Vec<u8>, byte: u8) {
    match byte {
        ESC => out.extend_from_slice(&[ESC, 0x00]),
        SYN => out.extend_from_slice(&[ESC, 0x01]),
        other => out.push(other),
    }
}

/// Incremental unescaper for received wire bytes.
#[derive(Debug, Default)]
pub struct Unescaper {
    pending_escape: bool,
}

/// One step of unescaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unescaped {
    /// First half of an escape pair consumed; no byte produced yet.
    Pending,
    Byte(u8),
    /// Escape byte followed by something other than 0x00/0x01.
    Invalid,
}

impl Unescaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, raw: u8) -> Unescaped {
        if self.pending_escape {
            self.pending_escape = false;
            match raw {
                0x00 => Unescaped::Byte(ESC),
                0x01 => Unescaped::Byte(SYN),
                _ => Unescaped::Invalid,
            }
        } else if raw == ESC {
            self.pending_escape = true;
            Unescaped::Pending
        } else {
            Unescaped::Byte(raw)
        }
    }
}

/// One master telegram before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub src: u8,
    pub dst: u8,
    pub primary: u8,
    pub secondary: u8,
    pub payload: Payload,
}

impl Telegram {
    pub fn new(src: u8, dst: u8, primary: u8, secondary: u8, payload: Payload) -> Self {
        Self {
            src,
            dst,
            primary,
            secondary,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST_ADDR
    }

    /// Unescaped frame bytes including length and trailing CRC.
    pub fn frame_bytes(&self) -> std::vec::Vec<u8> {
        let mut bytes = vec![
            self.src,
            self.dst,
            self.primary,
            self.secondary,
            self.payload.len() as u8,
        ];
        bytes.extend_from_slice(&self.payload);
        bytes.push(crc8(&bytes));
        bytes
    }

    /// Escaped byte sequence as transmitted on the wire.
    pub fn wire_bytes(&self) -> std::vec::Vec<u8> {
        let frame = self.frame_bytes();
        let mut wire = std::vec::Vec::with_capacity(frame.len() + 4);
        for &b in &frame {
            escape_into(&mut wire, b);
        }
        wire
    }
}

/// Builds the wire bytes of a slave reply (`ACK NN payload CRC`, escaped).
///
/// Used by the mock transport and by tests; the engine only ever parses
/// this shape.
pub fn reply_wire(payload: &[u8]) -> std::vec::Vec<u8> {
    let mut frame = vec![ACK, payload.len() as u8];
    frame.extend_from_slice(payload);
    // CRC covers length and payload, not the ACK
    let crc = crc8(&frame[1..]);
    frame.push(crc);
    let mut wire = std::vec::Vec::with_capacity(frame.len() + 4);
    for &b in &frame {
        escape_into(&mut wire, b);
    }
    wire
}

/// Why a reply frame was rejected. All reasons collapse to the same
/// retryable "no valid reply" outcome; they are kept apart for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Nak,
    BadEscape,
    /// First byte was neither ACK nor NAK.
    UnexpectedOpener,
    OversizeLength,
    Checksum,
}

/// Progress of an in-flight reply parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Pending,
    Complete(Payload),
    Invalid(InvalidReason),
}

#[derive(Debug)]
enum ReplyPhase {
    Ack,
    Len,
    Data { expected: usize },
    Crc,
}

/// Incremental parser for a slave reply, fed one raw wire byte at a time.
#[derive(Debug)]
pub struct ReplyReader {
    unescaper: Unescaper,
    phase: ReplyPhase,
    collected: Payload,
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyReader {
    pub fn new() -> Self {
        Self {
            unescaper: Unescaper::new(),
            phase: ReplyPhase::Ack,
            collected: Payload::new(),
        }
    }

    pub fn push(&mut self, raw: u8) -> ReplyStatus {
        let byte = match self.unescaper.push(raw) {
            Unescaped::Pending => return ReplyStatus::Pending,
            Unescaped::Invalid => return ReplyStatus::Invalid(InvalidReason::BadEscape),
            Unescaped::Byte(b) => b,
        };

        match self.phase {
            ReplyPhase::Ack => match byte {
                ACK => {
                    self.phase = ReplyPhase::Len;
                    ReplyStatus::Pending
                }
                NAK => ReplyStatus::Invalid(InvalidReason::Nak),
                _ => ReplyStatus::Invalid(InvalidReason::UnexpectedOpener),
            },
            ReplyPhase::Len => {
                let expected = byte as usize;
                if expected > MAX_PAYLOAD {
                    return ReplyStatus::Invalid(InvalidReason::OversizeLength);
                }
                self.phase = if expected == 0 {
                    ReplyPhase::Crc
                } else {
                    ReplyPhase::Data { expected }
                };
                ReplyStatus::Pending
            }
            ReplyPhase::Data { expected } => {
                // Length was bounds-checked above, push cannot fail
                let _ = self.collected.push(byte);
                if self.collected.len() == expected {
                    self.phase = ReplyPhase::Crc;
                }
                ReplyStatus::Pending
            }
            ReplyPhase::Crc => {
                let mut covered = vec![self.collected.len() as u8];
                covered.extend_from_slice(&self.collected);
                if crc8(&covered) == byte {
                    ReplyStatus::Complete(self.collected.clone())
                } else {
                    ReplyStatus::Invalid(InvalidReason::Checksum)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> Payload {
        Payload::from_slice(bytes).unwrap()
    }

    fn feed(reader: &mut ReplyReader, wire: &[u8]) -> ReplyStatus {
        let mut last = ReplyStatus::Pending;
        for &b in wire {
            last = reader.push(b);
            if last != ReplyStatus::Pending {
                return last;
            }
        }
        last
    }

    #[test]
    fn test_crc_is_order_sensitive() {
        assert_ne!(crc8(&[0x01, 0x02]), crc8(&[0x02, 0x01]));
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_telegram_frame_ends_with_crc() {
        let t = Telegram::new(0xFF, 0x08, 0xB5, 0x09, payload(&[0x0D]));
        let frame = t.frame_bytes();
        assert_eq!(frame[..6], [0xFF, 0x08, 0xB5, 0x09, 0x01, 0x0D]);
        assert_eq!(*frame.last().unwrap(), crc8(&frame[..6]));
    }

    #[test]
    fn test_escape_round_trip() {
        let mut wire = std::vec::Vec::new();
        for &b in &[0x10, SYN, ESC, 0x42] {
            escape_into(&mut wire, b);
        }
        // Two escaped bytes expand to two bytes each
        assert_eq!(wire.len(), 6);

        let mut un = Unescaper::new();
        let mut restored = std::vec::Vec::new();
        for &b in &wire {
            if let Unescaped::Byte(out) = un.push(b) {
                restored.push(out);
            }
        }
        assert_eq!(restored, vec![0x10, SYN, ESC, 0x42]);
    }

    #[test]
    fn test_invalid_escape_pair_rejected() {
        let mut un = Unescaper::new();
        assert_eq!(un.push(ESC), Unescaped::Pending);
        assert_eq!(un.push(0x7F), Unescaped::Invalid);
    }

    #[test]
    fn test_reply_reader_accepts_valid_reply() {
        let wire = reply_wire(&[0xD7, 0x00]);
        let mut reader = ReplyReader::new();
        match feed(&mut reader, &wire) {
            ReplyStatus::Complete(p) => assert_eq!(&p[..], &[0xD7, 0x00]),
            other => panic!("expected complete reply, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_reader_handles_escaped_payload_bytes() {
        let wire = reply_wire(&[SYN, ESC]);
        let mut reader = ReplyReader::new();
        match feed(&mut reader, &wire) {
            ReplyStatus::Complete(p) => assert_eq!(&p[..], &[SYN, ESC]),
            other => panic!("expected complete reply, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_crc_is_never_delivered() {
        let mut wire = reply_wire(&[0x11, 0x22, 0x33]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let mut reader = ReplyReader::new();
        assert_eq!(
            feed(&mut reader, &wire),
            ReplyStatus::Invalid(InvalidReason::Checksum)
        );
    }

    #[test]
    fn test_nak_treated_as_invalid() {
        let mut reader = ReplyReader::new();
        // NAK is 0xFF, not an escape byte, lands in the Ack phase
        assert_eq!(reader.push(NAK), ReplyStatus::Invalid(InvalidReason::Nak));
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut reader = ReplyReader::new();
        assert_eq!(reader.push(ACK), ReplyStatus::Pending);
        assert_eq!(
            reader.push((MAX_PAYLOAD + 1) as u8),
            ReplyStatus::Invalid(InvalidReason::OversizeLength)
        );
    }

    #[test]
    fn test_empty_reply_payload_is_valid() {
        let wire = reply_wire(&[]);
        let mut reader = ReplyReader::new();
        assert_eq!(feed(&mut reader, &wire), ReplyStatus::Complete(Payload::new()));
    }
}

//! # ASTM E1381 Session Codec
//!
//! Low-level framing for ASTM analyzer links: ENQ/ACK/NAK handshake,
//! STX...ETX/ETB frames with checksums and sequence numbers, EOT session
//! end.
//!
//! ## Session State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                                                                     │
//! │              ENQ / reply ACK                                        │
//! │   ┌──────┐ ─────────────────────► ┌────────────┐                    │
//! │   │ Idle │                        │ AwaitFrame │ ──┐ STX frame      │
//! │   └──────┘ ◄───────────────────── └────────────┘ ◄─┘ ACK or NAK     │
//! │              EOT / session end                                      │
//! │                                                                     │
//! │   Frame:  STX <seq> <text> <ETX|ETB> <hi> <lo> CR LF                │
//! │   seq:    single digit, cycles 0-7, starts at 1 per session         │
//! │   chksum: mod-256 sum of bytes after STX through ETX/ETB,           │
//! │           two uppercase hex digits                                  │
//! │   ETB:    intermediate frame; payload buffered and concatenated     │
//! │           with the following frames until an ETX frame arrives      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The codec never transmits by itself. It returns [`AstmEvent`]s; the
//! connection layer writes the replies, and crucially sends the ACK for a
//! message-completing frame only after the decoded message is durably
//! stored.

use tracing::{debug, warn};

// =============================================================================
// Control Characters
// =============================================================================

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;
pub const NAK: u8 = 0x15;
pub const ETB: u8 = 0x17;

/// Consecutive rejected frames tolerated before the connection is
/// declared dead.
pub const MAX_NAK_STREAK: u32 = 3;

/// Upper bound on a single frame. Large multi-frame messages arrive as
/// ETB continuations; a frame this size without a terminator is garbage.
const MAX_FRAME_BYTES: usize = 1 << 20;

// =============================================================================
// Events
// =============================================================================

/// What the connection layer must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstmEvent {
    /// Transmit these bytes immediately (handshake ACK).
    Reply(Vec<u8>),

    /// A frame failed validation: transmit NAK and surface a warning.
    /// The expected sequence number is unchanged.
    FrameRejected { reason: String },

    /// A valid intermediate (ETB) frame was accepted and buffered.
    /// Acknowledge immediately.
    FramePart,

    /// A valid final (ETX) frame completed a payload. Process it, then
    /// acknowledge once every derived row is committed.
    FrameComplete(Vec<u8>),

    /// EOT: the session is over. Flush the decoder; no reply is sent.
    SessionEnd,

    /// The peer keeps sending rejectable frames; close the connection.
    Fatal(String),
}

// =============================================================================
// Checksum
// =============================================================================

/// Mod-256 sum used by ASTM framing.
pub fn frame_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Renders a checksum as the two uppercase hex digits that travel on the
/// wire.
pub fn checksum_digits(sum: u8) -> [u8; 2] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [HEX[(sum >> 4) as usize], HEX[(sum & 0x0F) as usize]]
}

/// Builds a complete wire frame. Used by tests and simulators; the
/// receiver itself only ever sends single control bytes.
pub fn encode_frame(seq: u8, text: &[u8], last: bool) -> Vec<u8> {
    let terminator = if last { ETX } else { ETB };
    let mut checked = Vec::with_capacity(text.len() + 2);
    checked.push(b'0' + (seq % 8));
    checked.extend_from_slice(text);
    checked.push(terminator);

    let digits = checksum_digits(frame_checksum(&checked));

    let mut frame = Vec::with_capacity(checked.len() + 5);
    frame.push(STX);
    frame.extend_from_slice(&checked);
    frame.extend_from_slice(&digits);
    frame.push(CR);
    frame.push(LF);
    frame
}

// =============================================================================
// Codec
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the peer to open a session with ENQ.
    Idle,
    /// Session established; expecting frames or EOT.
    AwaitFrame,
}

enum FrameStatus {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// Frame rejected; already discarded from the buffer.
    Invalid(String),
    /// Valid ETB frame, payload buffered.
    Part,
    /// Valid ETX frame; full reassembled payload.
    Complete(Vec<u8>),
}

/// Incremental ASTM session codec. Feed it raw socket bytes, act on the
/// returned events.
#[derive(Debug)]
pub struct AstmCodec {
    state: SessionState,
    buffer: Vec<u8>,
    /// Payload accumulated across ETB continuations.
    assembled: Vec<u8>,
    expected_seq: u8,
    nak_streak: u32,
}

impl AstmCodec {
    pub fn new() -> Self {
        AstmCodec {
            state: SessionState::Idle,
            buffer: Vec::new(),
            assembled: Vec::new(),
            expected_seq: 1,
            nak_streak: 0,
        }
    }

    /// Current consecutive-rejection count, for diagnostics.
    pub fn nak_streak(&self) -> u32 {
        self.nak_streak
    }

    /// Feeds received bytes and returns the resulting events in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<AstmEvent> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.state {
                SessionState::Idle => {
                    if !self.consume_idle(&mut events) {
                        break;
                    }
                }
                SessionState::AwaitFrame => {
                    if !self.consume_await_frame(&mut events) {
                        break;
                    }
                }
            }
        }

        events
    }

    /// Idle: everything before an ENQ is noise. Returns false when no
    /// further progress can be made.
    fn consume_idle(&mut self, events: &mut Vec<AstmEvent>) -> bool {
        match self.buffer.iter().position(|&b| b == ENQ) {
            Some(pos) => {
                if pos > 0 {
                    warn!(discarded = pos, "Discarding bytes before ENQ");
                }
                self.buffer.drain(..=pos);
                self.start_session();
                events.push(AstmEvent::Reply(vec![ACK]));
                true
            }
            None => {
                if !self.buffer.is_empty() {
                    let had_control = self.buffer.iter().any(|&b| b == STX || b == EOT);
                    let n = self.buffer.len();
                    warn!(discarded = n, "Discarding bytes outside a session");
                    self.buffer.clear();
                    if had_control {
                        events.push(AstmEvent::FrameRejected {
                            reason: format!("{} bytes outside a session", n),
                        });
                    }
                }
                false
            }
        }
    }

    /// AwaitFrame: expect STX frames, a repeated ENQ, or EOT.
    fn consume_await_frame(&mut self, events: &mut Vec<AstmEvent>) -> bool {
        let Some(&first) = self.buffer.first() else {
            return false;
        };

        match first {
            EOT => {
                self.buffer.drain(..1);
                debug!("Session complete (EOT)");
                self.end_session();
                events.push(AstmEvent::SessionEnd);
                true
            }
            ENQ => {
                // Peer restarted the handshake mid-session.
                self.buffer.drain(..1);
                self.start_session();
                events.push(AstmEvent::Reply(vec![ACK]));
                true
            }
            STX => match self.take_frame() {
                FrameStatus::Incomplete => false,
                FrameStatus::Invalid(reason) => {
                    warn!(%reason, "Rejecting frame");
                    events.push(AstmEvent::FrameRejected { reason });
                    self.bump_nak(events);
                    true
                }
                FrameStatus::Part => {
                    self.nak_streak = 0;
                    events.push(AstmEvent::FramePart);
                    true
                }
                FrameStatus::Complete(payload) => {
                    self.nak_streak = 0;
                    events.push(AstmEvent::FrameComplete(payload));
                    true
                }
            },
            other => {
                // Resynchronize: drop everything up to the next frame or
                // session boundary.
                warn!(byte = other, "Unexpected byte in session, resynchronizing");
                match self.buffer.iter().position(|&b| b == STX || b == EOT) {
                    Some(pos) => {
                        self.buffer.drain(..pos);
                    }
                    None => self.buffer.clear(),
                }
                events.push(AstmEvent::FrameRejected {
                    reason: format!("unexpected byte 0x{:02X} in session", other),
                });
                self.bump_nak(events);
                true
            }
        }
    }

    /// Attempts to cut one complete frame off the front of the buffer.
    /// The buffer starts with STX when this is called.
    fn take_frame(&mut self) -> FrameStatus {
        // Locate the terminator.
        let term_pos = self.buffer[1..]
            .iter()
            .position(|&b| b == ETX || b == ETB)
            .map(|p| p + 1);

        let Some(term_pos) = term_pos else {
            if self.buffer.len() > MAX_FRAME_BYTES {
                let dropped = self.buffer.len();
                self.buffer.clear();
                return FrameStatus::Invalid(format!(
                    "no frame terminator within {} bytes",
                    dropped
                ));
            }
            return FrameStatus::Incomplete;
        };

        // Frame tail: two checksum digits, CR, LF.
        if self.buffer.len() < term_pos + 5 {
            return FrameStatus::Incomplete;
        }

        let frame: Vec<u8> = self.buffer.drain(..term_pos + 5).collect();
        let terminator = frame[term_pos];
        let checked = &frame[1..=term_pos];
        let wire_digits = [frame[term_pos + 1], frame[term_pos + 2]];

        if frame[term_pos + 3] != CR || frame[term_pos + 4] != LF {
            return FrameStatus::Invalid("frame not terminated by CR LF".into());
        }

        let expected_digits = checksum_digits(frame_checksum(checked));
        if wire_digits != expected_digits {
            return FrameStatus::Invalid(format!(
                "checksum mismatch: got {}{}, computed {}{}",
                wire_digits[0] as char,
                wire_digits[1] as char,
                expected_digits[0] as char,
                expected_digits[1] as char
            ));
        }

        let seq = frame[1];
        if !seq.is_ascii_digit() || seq > b'7' {
            return FrameStatus::Invalid(format!("bad sequence byte 0x{:02X}", seq));
        }
        let seq = seq - b'0';
        if seq != self.expected_seq {
            return FrameStatus::Invalid(format!(
                "sequence mismatch: got {}, expected {}",
                seq, self.expected_seq
            ));
        }

        // Frame accepted: advance the session sequence and surface the
        // payload (text between the sequence digit and the terminator).
        self.expected_seq = (self.expected_seq + 1) % 8;
        self.assembled.extend_from_slice(&frame[2..term_pos]);

        if terminator == ETB {
            FrameStatus::Part
        } else {
            FrameStatus::Complete(std::mem::take(&mut self.assembled))
        }
    }

    fn bump_nak(&mut self, events: &mut Vec<AstmEvent>) {
        self.nak_streak += 1;
        if self.nak_streak >= MAX_NAK_STREAK {
            events.push(AstmEvent::Fatal(format!(
                "{} consecutive rejected frames",
                self.nak_streak
            )));
        }
    }

    fn start_session(&mut self) {
        self.state = SessionState::AwaitFrame;
        self.expected_seq = 1;
        self.assembled.clear();
        self.nak_streak = 0;
    }

    fn end_session(&mut self) {
        self.state = SessionState::Idle;
        self.expected_seq = 1;
        self.assembled.clear();
    }
}

impl Default for AstmCodec {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_reply(event: &AstmEvent, byte: u8) {
        assert_eq!(event, &AstmEvent::Reply(vec![byte]));
    }

    #[test]
    fn checksum_matches_known_vector() {
        // "1H|\^&" + ETX: sum of the checked bytes mod 256.
        let mut checked = b"1H|\\^&".to_vec();
        checked.push(ETX);
        let sum = frame_checksum(&checked);
        let frame = encode_frame(1, b"H|\\^&", true);
        let digits = checksum_digits(sum);
        assert_eq!(&frame[frame.len() - 4..frame.len() - 2], &digits);
    }

    #[test]
    fn enq_opens_session_with_ack() {
        let mut codec = AstmCodec::new();
        let events = codec.push(&[ENQ]);
        assert_eq!(events.len(), 1);
        assert_reply(&events[0], ACK);
    }

    #[test]
    fn happy_path_session() {
        let mut codec = AstmCodec::new();
        assert_reply(&codec.push(&[ENQ])[0], ACK);

        let events = codec.push(&encode_frame(1, b"H|\\^&", true));
        assert_eq!(events, vec![AstmEvent::FrameComplete(b"H|\\^&".to_vec())]);

        let events = codec.push(&encode_frame(2, b"P|1|322288", true));
        assert_eq!(
            events,
            vec![AstmEvent::FrameComplete(b"P|1|322288".to_vec())]
        );

        let events = codec.push(&[EOT]);
        assert_eq!(events, vec![AstmEvent::SessionEnd]);
    }

    #[test]
    fn bad_checksum_gets_nak_then_retransmit_accepted() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        let mut frame = encode_frame(1, b"H|\\^&", true);
        let tampered = frame.len() - 4;
        frame[tampered] = frame[tampered].wrapping_add(1);
        let events = codec.push(&frame);
        assert!(matches!(events[0], AstmEvent::FrameRejected { .. }));

        // Expected sequence is unchanged; the retransmission goes through.
        let events = codec.push(&encode_frame(1, b"H|\\^&", true));
        assert_eq!(events, vec![AstmEvent::FrameComplete(b"H|\\^&".to_vec())]);
    }

    #[test]
    fn sequence_mismatch_rejected() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        let events = codec.push(&encode_frame(5, b"H|\\^&", true));
        assert!(matches!(
            events[0],
            AstmEvent::FrameRejected { ref reason } if reason.contains("sequence")
        ));
    }

    #[test]
    fn etb_frames_reassemble() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        let events = codec.push(&encode_frame(1, b"R|1|^^^GLU|5", false));
        assert_eq!(events, vec![AstmEvent::FramePart]);

        let events = codec.push(&encode_frame(2, b".3|mmol/L", true));
        assert_eq!(
            events,
            vec![AstmEvent::FrameComplete(b"R|1|^^^GLU|5.3|mmol/L".to_vec())]
        );
    }

    #[test]
    fn sequence_wraps_modulo_eight() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        for i in 0..9u8 {
            let seq = (1 + i) % 8;
            let events = codec.push(&encode_frame(seq, b"C|1|comment", true));
            assert!(
                matches!(events[0], AstmEvent::FrameComplete(_)),
                "frame {} rejected: {:?}",
                i,
                events
            );
        }
    }

    #[test]
    fn split_delivery_across_reads() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        let frame = encode_frame(1, b"H|\\^&", true);
        let (a, b) = frame.split_at(3);
        assert!(codec.push(a).is_empty());
        let events = codec.push(b);
        assert_eq!(events, vec![AstmEvent::FrameComplete(b"H|\\^&".to_vec())]);
    }

    #[test]
    fn three_rejections_are_fatal() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        for i in 0..3 {
            let mut frame = encode_frame(1, b"H|\\^&", true);
            let tampered = frame.len() - 4;
            frame[tampered] = frame[tampered].wrapping_add(1);
            let events = codec.push(&frame);
            assert!(matches!(events[0], AstmEvent::FrameRejected { .. }));
            if i == 2 {
                assert!(matches!(events.last(), Some(AstmEvent::Fatal(_))));
            }
        }
    }

    #[test]
    fn junk_between_frames_triggers_resync() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);

        let mut data = b"garbage".to_vec();
        data.extend_from_slice(&encode_frame(1, b"H|\\^&", true));
        let events = codec.push(&data);

        assert!(matches!(events[0], AstmEvent::FrameRejected { .. }));
        assert_eq!(
            events[1..],
            vec![AstmEvent::FrameComplete(b"H|\\^&".to_vec())]
        );
    }

    #[test]
    fn session_sequence_resets_after_eot() {
        let mut codec = AstmCodec::new();
        codec.push(&[ENQ]);
        codec.push(&encode_frame(1, b"H|\\^&", true));
        codec.push(&[EOT]);

        // New session starts back at 1.
        codec.push(&[ENQ]);
        let events = codec.push(&encode_frame(1, b"H|\\^&", true));
        assert_eq!(events, vec![AstmEvent::FrameComplete(b"H|\\^&".to_vec())]);
    }
}

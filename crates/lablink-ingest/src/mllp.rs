//! # MLLP Envelope Codec
//!
//! Minimum Lower Layer Protocol framing for HL7 v2.x over TCP:
//! `VT (0x0B) <message> FS (0x1C) CR (0x0D)`. There is no checksum;
//! integrity relies on TCP. Bytes outside an envelope are discarded with
//! a warning.

use chrono::Utc;
use tracing::warn;

pub const VT: u8 = 0x0B;
pub const FS: u8 = 0x1C;
pub const CR: u8 = 0x0D;

/// Envelopes larger than this are dropped as garbage.
const MAX_ENVELOPE_BYTES: usize = 4 << 20;

// =============================================================================
// Acknowledgement Codes
// =============================================================================

/// MSA-1 acknowledgement codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept: message decoded and stored.
    Accept,
    /// Application error: the message could not be parsed.
    Error,
    /// Application reject: required segments or identifiers missing.
    Reject,
}

impl AckCode {
    fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Events produced while scanning the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MllpEvent {
    /// A complete HL7 message (envelope bytes stripped).
    Message(Vec<u8>),
    /// Bytes discarded outside an envelope.
    Junk(usize),
}

/// Incremental MLLP envelope scanner.
#[derive(Debug, Default)]
pub struct MllpCodec {
    buffer: Vec<u8>,
}

impl MllpCodec {
    pub fn new() -> Self {
        MllpCodec { buffer: Vec::new() }
    }

    /// Feeds received bytes and returns any completed envelopes.
    pub fn push(&mut self, data: &[u8]) -> Vec<MllpEvent> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            // Drop anything before the next VT.
            match self.buffer.iter().position(|&b| b == VT) {
                Some(0) => {}
                Some(pos) => {
                    warn!(discarded = pos, "Discarding bytes outside MLLP envelope");
                    self.buffer.drain(..pos);
                    events.push(MllpEvent::Junk(pos));
                }
                None => {
                    if !self.buffer.is_empty() {
                        let n = self.buffer.len();
                        warn!(discarded = n, "Discarding bytes outside MLLP envelope");
                        self.buffer.clear();
                        events.push(MllpEvent::Junk(n));
                    }
                    break;
                }
            }

            // Buffer starts with VT; look for the closing FS.
            let Some(end) = self.buffer.iter().position(|&b| b == FS) else {
                if self.buffer.len() > MAX_ENVELOPE_BYTES {
                    let n = self.buffer.len();
                    warn!(discarded = n, "Oversized MLLP envelope discarded");
                    self.buffer.clear();
                    events.push(MllpEvent::Junk(n));
                }
                break;
            };

            // Wait for the byte after FS so the trailing CR is consumed
            // with its envelope instead of surfacing as junk.
            if end + 1 == self.buffer.len() {
                break;
            }

            let message = self.buffer[1..end].to_vec();

            let mut consume = end + 1;
            if self.buffer.get(consume) == Some(&CR) {
                consume += 1;
            }
            self.buffer.drain(..consume);

            events.push(MllpEvent::Message(message));
        }

        events
    }
}

// =============================================================================
// Acknowledgement Builder
// =============================================================================

/// Builds an enveloped HL7 acknowledgement echoing the original message
/// control id in MSA-2.
pub fn build_ack(app_name: &str, control_id: &str, code: AckCode) -> Vec<u8> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let msh = format!(
        "MSH|^~\\&|{}|LAB||SENDER|{}||ACK|{}|P|2.3.1",
        app_name, timestamp, control_id
    );
    let msa = format!("MSA|{}|{}", code.as_str(), control_id);

    let mut out = Vec::with_capacity(msh.len() + msa.len() + 4);
    out.push(VT);
    out.extend_from_slice(msh.as_bytes());
    out.push(CR);
    out.extend_from_slice(msa.as_bytes());
    out.push(CR);
    out.push(FS);
    out.push(CR);
    out
}

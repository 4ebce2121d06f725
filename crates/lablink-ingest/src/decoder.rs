//! # Record Decoders
//!
//! Turn validated frame payloads into protocol-neutral [`WireMessage`]s.
//!
//! The ASTM decoder is incremental: records accumulate frame by frame and
//! a message is finalized by the `L` terminator record (or by session end
//! for analyzers that never send one). The HL7 decoder is whole-message:
//! one MLLP envelope is one message.

use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};
use crate::record::{Delimiters, Record, RecordType, WireMessage};

// =============================================================================
// ASTM Decoder
// =============================================================================

/// Incremental ASTM record decoder.
#[derive(Debug)]
pub struct AstmDecoder {
    delimiters: Delimiters,
    records: Vec<Record>,
}

impl AstmDecoder {
    pub fn new() -> Self {
        AstmDecoder {
            delimiters: Delimiters::default(),
            records: Vec::new(),
        }
    }

    /// Feeds one complete (reassembled) frame payload. The payload holds
    /// one or more CR-separated records; any message completed by an `L`
    /// record is returned.
    pub fn push_payload(&mut self, payload: &[u8]) -> Vec<WireMessage> {
        let text = String::from_utf8_lossy(payload);
        let mut completed = Vec::new();

        for line in text.split('\r') {
            let line = line.trim_matches(|c| c == '\n' || c == ' ');
            if line.is_empty() {
                continue;
            }

            let Some(record) = self.parse_line(line) else {
                continue;
            };

            // A header opens a message. If the previous one never saw its
            // terminator, close it out rather than merging two sessions.
            if record.kind == RecordType::Header && !self.records.is_empty() {
                warn!("Header before terminator, finalizing previous message");
                completed.push(self.finish());
            }

            let terminate = record.kind == RecordType::Terminator;
            self.records.push(record);

            if terminate {
                completed.push(self.finish());
            }
        }

        completed
    }

    /// Finalizes a pending message at session end (EOT without `L`).
    pub fn flush(&mut self) -> Option<WireMessage> {
        if self.records.is_empty() {
            return None;
        }
        warn!("Session ended without terminator record, finalizing message");
        Some(self.finish())
    }

    fn finish(&mut self) -> WireMessage {
        WireMessage {
            records: std::mem::take(&mut self.records),
            delimiters: self.delimiters,
            control_id: None,
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<Record> {
        // Some analyzers prefix the record type with the frame sequence
        // ("2P|1|..."); strip it so indexes stay uniform.
        let stripped = line.trim_start_matches(|c: char| c.is_ascii_digit());
        let type_char = stripped.chars().next()?;

        let Some(kind) = RecordType::from_astm(type_char) else {
            warn!(record = %line, "Unknown record type, skipping");
            return None;
        };

        if kind == RecordType::Header {
            self.delimiters = Delimiters::from_astm_header(stripped);
            debug!(field = %self.delimiters.field, "Delimiters from header record");
        }

        let fields = stripped
            .split(self.delimiters.field)
            .map(str::to_string)
            .collect();

        Some(Record { kind, fields })
    }
}

impl Default for AstmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// HL7 Decoder
// =============================================================================

/// Whole-message HL7 v2.x decoder.
#[derive(Debug, Default)]
pub struct Hl7Decoder;

impl Hl7Decoder {
    /// Decodes one enveloped HL7 message into a [`WireMessage`].
    ///
    /// The first segment must be MSH; the field separator is read from
    /// MSH-1 and the encoding characters from MSH-2. Segments the
    /// pipeline does not model (PV1, EVN, ...) are skipped.
    pub fn decode(message: &[u8]) -> IngestResult<WireMessage> {
        let text = String::from_utf8_lossy(message);
        let mut segments = text.split('\r').filter(|s| !s.trim().is_empty());

        let msh = segments
            .next()
            .ok_or_else(|| IngestError::Decode("empty HL7 message".into()))?;
        if !msh.starts_with("MSH") || msh.len() < 4 {
            return Err(IngestError::Decode(format!(
                "message does not start with MSH: {:.16}",
                msh
            )));
        }

        let delimiters = Delimiters::from_msh(msh);
        let msh_fields: Vec<String> = msh
            .split(delimiters.field)
            .map(str::to_string)
            .collect();
        let control_id = msh_fields.get(9).cloned().filter(|id| !id.is_empty());

        let mut records = vec![Record {
            kind: RecordType::Header,
            fields: msh_fields,
        }];

        for segment in segments {
            let seg_id: String = segment.chars().take(3).collect();
            let Some(kind) = RecordType::from_hl7(&seg_id) else {
                debug!(segment = %seg_id, "Skipping unmodeled segment");
                continue;
            };

            records.push(Record {
                kind,
                fields: segment
                    .split(delimiters.field)
                    .map(str::to_string)
                    .collect(),
            });
        }

        Ok(WireMessage {
            records,
            delimiters,
            control_id,
        })
    }

    /// Best-effort extraction of MSH-10 from raw bytes, for building an
    /// AE acknowledgement when full decoding failed.
    pub fn peek_control_id(message: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(message);
        let msh = text.split('\r').next()?;
        let sep = msh.chars().nth(3)?;
        msh.split(sep).nth(9).map(str::to_string).filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Tests
// =============================================================================

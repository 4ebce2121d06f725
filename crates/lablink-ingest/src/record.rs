//! # Protocol-Neutral Records
//!
//! Both decoders produce the same shape: an ordered list of typed records
//! whose fields are already split on the session's field delimiter.
//! Downstream code addresses fields by index and never needs to know
//! which protocol carried them.

// =============================================================================
// Record Types
// =============================================================================

/// The record/segment kinds the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// ASTM `H` / HL7 `MSH`.
    Header,
    /// ASTM `P` / HL7 `PID`.
    Patient,
    /// ASTM `O` / HL7 `OBR`.
    Order,
    /// ASTM `R` / HL7 `OBX`.
    Result,
    /// ASTM `C` / HL7 `NTE`.
    Comment,
    /// ASTM `Q`. Recorded but never acted upon (the receiver does not
    /// answer host queries).
    Query,
    /// ASTM `M`. Vendor blobs (Cobas emits these); kept as comments.
    Manufacturer,
    /// ASTM `L`. Finalizes the message.
    Terminator,
}

impl RecordType {
    /// Maps an ASTM record-type letter.
    pub fn from_astm(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'H' => Some(RecordType::Header),
            'P' => Some(RecordType::Patient),
            'O' => Some(RecordType::Order),
            'R' => Some(RecordType::Result),
            'C' => Some(RecordType::Comment),
            'Q' => Some(RecordType::Query),
            'M' => Some(RecordType::Manufacturer),
            'L' => Some(RecordType::Terminator),
            _ => None,
        }
    }

    /// Maps an HL7 segment id.
    pub fn from_hl7(segment: &str) -> Option<Self> {
        match segment {
            "MSH" => Some(RecordType::Header),
            "PID" => Some(RecordType::Patient),
            "OBR" => Some(RecordType::Order),
            "OBX" => Some(RecordType::Result),
            "NTE" => Some(RecordType::Comment),
            _ => None,
        }
    }
}

// =============================================================================
// Delimiters
// =============================================================================

/// Session delimiters. ASTM announces them in the `H` record, HL7 in
/// MSH-1/MSH-2; both default to the standard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub repeat: char,
    pub component: char,
    pub escape: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            field: '|',
            repeat: '\\',
            component: '^',
            escape: '&',
        }
    }
}

impl Delimiters {
    /// Reads delimiters from an ASTM header line (`H|\^&|...`): the field
    /// delimiter follows the `H`, then repeat, component and escape.
    pub fn from_astm_header(line: &str) -> Self {
        let mut chars = line.chars();
        // Skip the record type letter (seq prefix already stripped).
        chars.next();

        let mut delims = Delimiters::default();
        if let Some(field) = chars.next() {
            delims.field = field;
        }
        if let Some(repeat) = chars.next() {
            if repeat != delims.field {
                delims.repeat = repeat;
            }
        }
        if let Some(component) = chars.next() {
            if component != delims.field {
                delims.component = component;
            }
        }
        if let Some(escape) = chars.next() {
            if escape != delims.field {
                delims.escape = escape;
            }
        }
        delims
    }

    /// Reads delimiters from an HL7 MSH segment (`MSH|^~\&|...`): MSH-1
    /// is the field separator, MSH-2 the encoding characters (component,
    /// repeat, escape, subcomponent).
    pub fn from_msh(segment: &str) -> Self {
        let mut delims = Delimiters::default();
        let bytes: Vec<char> = segment.chars().collect();

        if bytes.len() > 3 {
            delims.field = bytes[3];
        }
        if bytes.len() > 4 {
            delims.component = bytes[4];
        }
        if bytes.len() > 5 {
            delims.repeat = bytes[5];
        }
        if bytes.len() > 6 {
            delims.escape = bytes[6];
        }
        delims
    }
}

// =============================================================================
// Record & Message
// =============================================================================

/// One wire record with its fields split on the field delimiter.
///
/// Index 0 is the record type token (`P`, `PID`, ...); indexes follow the
/// wire numbering from there, so ASTM `P` field 3 and HL7 `PID-2` both
/// land at index 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub fields: Vec<String>,
}

impl Record {
    /// Field by index, empty string when absent.
    pub fn field(&self, idx: usize) -> &str {
        self.fields.get(idx).map(String::as_str).unwrap_or("")
    }

    /// Component of a field, split on the component delimiter.
    pub fn component<'a>(&'a self, idx: usize, comp: usize, delims: &Delimiters) -> &'a str {
        self.field(idx)
            .split(delims.component)
            .nth(comp)
            .unwrap_or("")
    }
}

/// A decoded message: the ordered records of one transmission, plus the
/// session delimiters and (for HL7) the message control id used in the
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub records: Vec<Record>,
    pub delimiters: Delimiters,
    pub control_id: Option<String>,
}

impl WireMessage {
    /// First record of the given kind.
    pub fn first(&self, kind: RecordType) -> Option<&Record> {
        self.records.iter().find(|r| r.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn astm_header_delimiters() {
        let delims = Delimiters::from_astm_header("H|\\^&");
        assert_eq!(delims.field, '|');
        assert_eq!(delims.repeat, '\\');
        assert_eq!(delims.component, '^');
        assert_eq!(delims.escape, '&');
    }

    #[test]
    fn msh_delimiters() {
        let delims = Delimiters::from_msh("MSH|^~\\&|Mindray|BS-430");
        assert_eq!(delims.field, '|');
        assert_eq!(delims.component, '^');
        assert_eq!(delims.repeat, '~');
        assert_eq!(delims.escape, '\\');
    }

    #[test]
    fn field_and_component_access() {
        let rec = Record {
            kind: RecordType::Result,
            fields: vec!["R".into(), "1".into(), "^^^GLU".into(), "5.3".into()],
        };
        let delims = Delimiters::default();
        assert_eq!(rec.field(3), "5.3");
        assert_eq!(rec.field(9), "");
        assert_eq!(rec.component(2, 3, &delims), "GLU");
        assert_eq!(rec.component(2, 0, &delims), "");
    }
}

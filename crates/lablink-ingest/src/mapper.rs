//! # Field Mapper
//!
//! Projects a [`WireMessage`] onto the canonical domain model using a
//! data-driven field map. Vendor quirks are table entries selected by
//! analyzer type or by an explicit `field_map_id`, never subclasses.
//!
//! Mapping errors are non-fatal: the offending record is dropped, a
//! warning is surfaced and the rest of the message survives. The one hard
//! failure is a patient with neither an external nor an internal id,
//! which rejects the whole message.

use chrono::NaiveDate;
use tracing::{debug, warn};

use lablink_core::{
    AnalyzerType, CanonicalMessage, NewOrder, NewPatient, NewResult, OrderGroup, WireProtocol,
};

use crate::error::{IngestError, IngestResult, MappingWarning};
use crate::record::{Record, RecordType, WireMessage};

// =============================================================================
// Field References
// =============================================================================

/// Where a value lives inside a record: a field index and optionally a
/// component within that field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub field: usize,
    pub component: Option<usize>,
}

impl FieldRef {
    pub const fn field(field: usize) -> Self {
        FieldRef {
            field,
            component: None,
        }
    }

    pub const fn component(field: usize, component: usize) -> Self {
        FieldRef {
            field,
            component: Some(component),
        }
    }

    fn extract(&self, record: &Record, delims: &crate::record::Delimiters) -> String {
        match self.component {
            Some(comp) => record.component(self.field, comp, delims).trim().to_string(),
            None => record.field(self.field).trim().to_string(),
        }
    }
}

// =============================================================================
// Field Map
// =============================================================================

/// A complete projection table for one protocol dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    pub patient_external_id: FieldRef,
    pub patient_internal_id: FieldRef,
    pub patient_name: FieldRef,
    pub patient_dob: FieldRef,
    pub patient_sex: FieldRef,
    pub patient_physician: FieldRef,

    pub order_sample_id: FieldRef,
    pub order_service_id: FieldRef,
    pub order_observed_at: FieldRef,

    pub result_test_code: FieldRef,
    pub result_value: FieldRef,
    pub result_units: FieldRef,
    pub result_reference: FieldRef,
    pub result_flags: FieldRef,
    pub result_observed_at: FieldRef,

    /// Comment text position (C-4 / NTE-3).
    pub comment_text: FieldRef,
}

impl FieldMap {
    /// Standard E1394 projection.
    pub fn astm_default() -> Self {
        FieldMap {
            // P-3 practice-assigned id, first component; P-4 lab-assigned.
            patient_external_id: FieldRef::component(2, 0),
            patient_internal_id: FieldRef::field(3),
            patient_name: FieldRef::field(5),
            patient_dob: FieldRef::field(7),
            patient_sex: FieldRef::field(8),
            patient_physician: FieldRef::field(14),

            order_sample_id: FieldRef::component(2, 0),
            order_service_id: FieldRef::field(4),
            order_observed_at: FieldRef::field(7),

            // Universal test id ^^^CODE: manufacturer code is the fourth
            // component.
            result_test_code: FieldRef::component(2, 3),
            result_value: FieldRef::field(3),
            result_units: FieldRef::field(4),
            result_reference: FieldRef::field(5),
            result_flags: FieldRef::field(6),
            result_observed_at: FieldRef::field(12),

            comment_text: FieldRef::field(3),
        }
    }

    /// Standard HL7 v2.x ORU projection.
    pub fn hl7_default() -> Self {
        FieldMap {
            patient_external_id: FieldRef::component(2, 0),
            patient_internal_id: FieldRef::component(3, 0),
            patient_name: FieldRef::field(5),
            patient_dob: FieldRef::field(7),
            patient_sex: FieldRef::field(8),
            patient_physician: FieldRef::field(15),

            // OBR-3 filler order number.
            order_sample_id: FieldRef::component(3, 0),
            order_service_id: FieldRef::field(4),
            order_observed_at: FieldRef::field(7),

            result_test_code: FieldRef::component(3, 0),
            result_value: FieldRef::field(5),
            result_units: FieldRef::component(6, 0),
            result_reference: FieldRef::field(7),
            result_flags: FieldRef::field(8),
            result_observed_at: FieldRef::field(14),

            comment_text: FieldRef::field(3),
        }
    }

    /// Resolves the map for a listener.
    ///
    /// Precedence: explicit `field_map_id` from the config, then the
    /// per-analyzer override table, then the protocol default. The
    /// override table ships empty on purpose: the original firmware
    /// disagree about where patient ids live, so site-specific overrides
    /// are configured, not guessed.
    pub fn resolve(
        analyzer: AnalyzerType,
        protocol: WireProtocol,
        field_map_id: Option<&str>,
    ) -> Self {
        let base = match protocol {
            WireProtocol::Astm => Self::astm_default(),
            WireProtocol::Hl7 => Self::hl7_default(),
        };

        if let Some(id) = field_map_id {
            return Self::named(id, protocol).unwrap_or_else(|| {
                warn!(field_map_id = %id, "Unknown field map id, using protocol default");
                base
            });
        }

        // Per-analyzer override table. Intentionally empty: the source
        // field for patient ids varies by site even within one vendor, so
        // overrides are selected via field_map_id instead of guessed here.
        let _ = analyzer;
        base
    }

    /// Named override maps selectable from the configuration.
    fn named(id: &str, protocol: WireProtocol) -> Option<Self> {
        match (id, protocol) {
            ("default", WireProtocol::Astm) | ("astm_default", WireProtocol::Astm) => {
                Some(Self::astm_default())
            }
            ("default", WireProtocol::Hl7) | ("hl7_default", WireProtocol::Hl7) => {
                Some(Self::hl7_default())
            }
            // Analyzers that put the patient id in PID-3 only.
            ("hl7_pid3_patient_id", WireProtocol::Hl7) => Some(FieldMap {
                patient_external_id: FieldRef::component(3, 0),
                patient_internal_id: FieldRef::component(2, 0),
                ..Self::hl7_default()
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Message Mapping
// =============================================================================

/// Maps a decoded message onto the canonical model.
///
/// Returns the canonical message plus any warnings for records that were
/// dropped along the way. Fails only when the message carries no usable
/// patient identity.
pub fn map_message(
    msg: &WireMessage,
    analyzer: AnalyzerType,
    map: &FieldMap,
) -> IngestResult<(CanonicalMessage, Vec<MappingWarning>)> {
    let mut warnings = Vec::new();
    let delims = &msg.delimiters;

    let patient_record = msg
        .first(RecordType::Patient)
        .ok_or_else(|| IngestError::InvalidRecord("message has no patient record".into()))?;

    let mut patient = NewPatient {
        external_id: map.patient_external_id.extract(patient_record, delims),
        internal_id: map.patient_internal_id.extract(patient_record, delims),
        name: join_name(map.patient_name.extract(patient_record, delims), delims),
        dob: None,
        sex: none_if_empty(map.patient_sex.extract(patient_record, delims)),
        physician: none_if_empty(map.patient_physician.extract(patient_record, delims)),
    };

    let raw_dob = map.patient_dob.extract(patient_record, delims);
    patient.dob = normalize_dob(&raw_dob, &mut warnings);

    if !patient.has_identity() {
        return Err(IngestError::InvalidRecord(
            "patient record carries neither an external nor an internal id".into(),
        ));
    }

    let mut orders: Vec<OrderGroup> = Vec::new();
    // Comments attach to the record they trail: the last result when one
    // was just mapped, otherwise the current order.
    let mut comment_target = CommentTarget::None;

    for record in &msg.records {
        match record.kind {
            RecordType::Order => {
                let sample_id = map.order_sample_id.extract(record, delims);
                if sample_id.is_empty() {
                    warn!("Order record with empty sample id");
                }
                orders.push(OrderGroup {
                    order: NewOrder {
                        sample_id,
                        universal_service_id: none_if_empty(
                            map.order_service_id.extract(record, delims),
                        ),
                        ordered_at: none_if_empty(map.order_observed_at.extract(record, delims)),
                        comments: Vec::new(),
                    },
                    results: Vec::new(),
                });
                comment_target = CommentTarget::Order;
            }

            RecordType::Result => {
                let test_code = map.result_test_code.extract(record, delims);
                if test_code.is_empty() {
                    warnings.push(MappingWarning::new(format!(
                        "result record without test code dropped: {:.40}",
                        record.fields.join("|")
                    )));
                    // Its trailing comments fall back to the order.
                    if !orders.is_empty() {
                        comment_target = CommentTarget::Order;
                    }
                    continue;
                }

                if orders.is_empty() {
                    // Results before any order record: bind them to an
                    // implicit unnamed order.
                    warn!("Result before order record, creating implicit order");
                    orders.push(OrderGroup::default());
                }

                let result = NewResult {
                    test_code,
                    value: map.result_value.extract(record, delims),
                    units: none_if_empty(map.result_units.extract(record, delims)),
                    reference_range: none_if_empty(map.result_reference.extract(record, delims)),
                    flags: none_if_empty(map.result_flags.extract(record, delims)),
                    observed_at: none_if_empty(map.result_observed_at.extract(record, delims)),
                    comments: Vec::new(),
                };
                orders.last_mut().unwrap().results.push(result);
                comment_target = CommentTarget::Result;
            }

            RecordType::Comment | RecordType::Manufacturer => {
                let text = map.comment_text.extract(record, delims);
                if text.is_empty() {
                    continue;
                }
                match comment_target {
                    CommentTarget::Result => {
                        let group = orders.last_mut().expect("result target implies an order");
                        group
                            .results
                            .last_mut()
                            .expect("result target implies a result")
                            .comments
                            .push(text);
                    }
                    CommentTarget::Order => {
                        orders
                            .last_mut()
                            .expect("order target implies an order")
                            .order
                            .comments
                            .push(text);
                    }
                    CommentTarget::None => {
                        warnings.push(MappingWarning::new(format!(
                            "comment with no preceding order or result dropped: {:.40}",
                            text
                        )));
                    }
                }
            }

            RecordType::Query => {
                debug!("Query record recorded, not acted upon");
            }

            RecordType::Header | RecordType::Patient | RecordType::Terminator => {}
        }
    }

    Ok((
        CanonicalMessage {
            analyzer,
            patient,
            orders,
        },
        warnings,
    ))
}

/// Where the next comment record belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentTarget {
    /// No order or result has been seen yet.
    None,
    /// Attach to the most recent order.
    Order,
    /// Attach to the most recent result.
    Result,
}

/// Joins `^`-separated name components with spaces, dropping empties.
fn join_name(raw: String, delims: &crate::record::Delimiters) -> Option<String> {
    let joined = raw
        .split(delims.component)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    none_if_empty(joined)
}

/// Normalizes a wire date of birth. YYYYMMDD (optionally followed by a
/// time) becomes ISO `YYYY-MM-DD`; anything else is kept verbatim with a
/// warning.
fn normalize_dob(raw: &str, warnings: &mut Vec<MappingWarning>) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    if raw.len() >= 8 && raw.as_bytes()[..8].iter().all(u8::is_ascii_digit) {
        if let Ok(date) = NaiveDate::parse_from_str(&raw[..8], "%Y%m%d") {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    warnings.push(MappingWarning::new(format!(
        "could not parse birth date '{}', keeping verbatim",
        raw
    )));
    Some(raw.to_string())
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Domain Types
//!
//! Canonical entities shared by the ingest, persistence and sync layers.
//!
//! ## Two shapes per entity
//! The decoders produce *unsaved* records (`NewPatient`, `NewOrder`,
//! `NewResult`) with no database identity. The persistence layer upserts
//! them and hands back the stored rows (`Patient`, `LabOrder`,
//! `TestResult`) with integer ids and bookkeeping columns. Everything
//! upstream of the store only ever holds the unsaved shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// Analyzer Type
// =============================================================================

/// Supported laboratory analyzers.
///
/// Vendor quirks are expressed as field-map table entries keyed by this
/// enum, not as parser subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerType {
    /// Sysmex XN-L series hematology analyzer.
    SysmexXnL,
    /// Mindray BS-430 chemistry analyzer.
    MindrayBs430,
    /// Roche Cobas chemistry family (c111, c311, c501, Integra).
    RocheCobas,
    /// Siemens Dimension chemistry analyzer.
    SiemensDimension,
    /// Beckman Coulter AU series.
    BeckmanAu,
    /// Ortho VITROS immunoassay analyzer.
    Vitros,
}

impl AnalyzerType {
    /// The wire protocol this analyzer ships with by default.
    pub fn default_protocol(&self) -> WireProtocol {
        match self {
            AnalyzerType::MindrayBs430 => WireProtocol::Hl7,
            _ => WireProtocol::Astm,
        }
    }

    /// Marketing name, used in logs and event summaries.
    pub fn display_name(&self) -> &'static str {
        match self {
            AnalyzerType::SysmexXnL => "SYSMEX XN-L",
            AnalyzerType::MindrayBs430 => "Mindray BS-430",
            AnalyzerType::RocheCobas => "Roche Cobas",
            AnalyzerType::SiemensDimension => "Siemens Dimension",
            AnalyzerType::BeckmanAu => "Beckman AU",
            AnalyzerType::Vitros => "VITROS",
        }
    }
}

impl std::fmt::Display for AnalyzerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for AnalyzerType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sysmex_xn_l" | "sysmex xn-l" | "sysmex" => Ok(AnalyzerType::SysmexXnL),
            "mindray_bs_430" | "mindray bs-430" | "mindray" => Ok(AnalyzerType::MindrayBs430),
            "roche_cobas" | "roche cobas" | "cobas" => Ok(AnalyzerType::RocheCobas),
            "siemens_dimension" | "siemens dimension" | "dimension" => {
                Ok(AnalyzerType::SiemensDimension)
            }
            "beckman_au" | "beckman au" | "beckman" => Ok(AnalyzerType::BeckmanAu),
            "vitros" => Ok(AnalyzerType::Vitros),
            other => Err(ValidationError::InvalidFormat {
                field: "analyzer_type".into(),
                reason: format!("unknown analyzer '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Wire Protocol
// =============================================================================

/// Wire protocol spoken on a listener port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    /// ASTM E1381 framing carrying E1394 records.
    Astm,
    /// HL7 v2.x messages inside MLLP envelopes.
    Hl7,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Astm => write!(f, "ASTM"),
            WireProtocol::Hl7 => write!(f, "HL7"),
        }
    }
}

impl std::str::FromStr for WireProtocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "astm" => Ok(WireProtocol::Astm),
            "hl7" | "hl7v2" | "mllp" => Ok(WireProtocol::Hl7),
            other => Err(ValidationError::InvalidFormat {
                field: "protocol".into(),
                reason: format!("unknown protocol '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Per-row outbound synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Stored locally, not yet acknowledged by the remote endpoint.
    #[default]
    Local,
    /// Remote endpoint returned 2xx for this row.
    Synced,
    /// Remote endpoint rejected the row with a non-retryable 4xx.
    /// Excluded from all future batches.
    Poisoned,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Local => write!(f, "local"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Poisoned => write!(f, "poisoned"),
        }
    }
}

// =============================================================================
// Listener Specification
// =============================================================================

/// One bound TCP acceptor: a port tied to an analyzer and a protocol.
///
/// Specs are replaced atomically on reload; the supervisor diffs the new
/// set against the running set by port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    /// TCP port to bind (unique within the running set).
    pub port: u16,

    /// Analyzer expected on this port.
    pub analyzer_type: AnalyzerType,

    /// Wire protocol spoken on this port.
    pub protocol: WireProtocol,

    /// Optional field-map override name. Defaults to the per-analyzer map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_map_id: Option<String>,
}

// =============================================================================
// Unsaved (decoder-side) shapes
// =============================================================================

/// Patient demographics as extracted from a wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPatient {
    /// Practice/hospital assigned identifier (PID-2, ASTM P-3).
    pub external_id: String,
    /// Laboratory assigned identifier (PID-3, ASTM P-4).
    pub internal_id: String,
    pub name: Option<String>,
    /// ISO date when parseable, otherwise the verbatim wire value.
    pub dob: Option<String>,
    pub sex: Option<String>,
    pub physician: Option<String>,
}

impl NewPatient {
    /// At least one identifier must be present for the message to be
    /// accepted.
    pub fn has_identity(&self) -> bool {
        !self.external_id.is_empty() || !self.internal_id.is_empty()
    }
}

/// Order (specimen) data as extracted from a wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Specimen identifier (OBR-3 filler order number, ASTM O-3).
    /// May be empty; an empty value is logged but tolerated.
    pub sample_id: String,
    pub universal_service_id: Option<String>,
    pub ordered_at: Option<String>,
    /// Comment records that followed this order on the wire, before any
    /// of its results.
    pub comments: Vec<String>,
}

/// A single observation as extracted from a wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewResult {
    pub test_code: String,
    /// Values are kept verbatim as strings; the receiver does not
    /// interpret units or numeric formats.
    pub value: String,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub flags: Option<String>,
    pub observed_at: Option<String>,
    /// Comment records that followed this result on the wire.
    pub comments: Vec<String>,
}

/// An order together with the results bound to it, in wire order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderGroup {
    pub order: NewOrder,
    pub results: Vec<NewResult>,
}

/// A fully mapped message ready for persistence: one patient and the
/// order groups that followed it on the wire. Comment records live on
/// the order or result they trailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub analyzer: AnalyzerType,
    pub patient: NewPatient,
    pub orders: Vec<OrderGroup>,
}

impl CanonicalMessage {
    /// Total number of results across all order groups.
    pub fn result_count(&self) -> usize {
        self.orders.iter().map(|g| g.results.len()).sum()
    }

    /// Sample id of the first order, for summaries.
    pub fn first_sample_id(&self) -> &str {
        self.orders
            .first()
            .map(|g| g.order.sample_id.as_str())
            .unwrap_or("")
    }
}

// =============================================================================
// Stored rows
// =============================================================================

/// A patient row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Patient {
    pub id: i64,
    pub analyzer: AnalyzerType,
    pub external_id: String,
    pub internal_id: String,
    pub name: Option<String>,
    pub dob: Option<String>,
    pub sex: Option<String>,
    pub physician: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An order row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct LabOrder {
    pub id: i64,
    pub patient_id: i64,
    pub sample_id: String,
    pub universal_service_id: Option<String>,
    pub ordered_at: Option<String>,
    /// Order-level comment lines, newline-joined.
    pub comments: Option<String>,
    pub analyzer: AnalyzerType,
    pub created_at: DateTime<Utc>,
}

/// A result row as stored. Mutated only to advance its sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TestResult {
    pub id: i64,
    pub order_id: i64,
    pub test_code: String,
    pub value: String,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub flags: Option<String>,
    pub observed_at: String,
    /// Result-level comment lines, newline-joined.
    pub comments: Option<String>,
    pub sync_status: SyncStatus,
    /// Failed delivery attempts so far.
    pub attempts: i64,
    /// Earliest time the next delivery attempt may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn default_protocol_per_analyzer() {
        assert_eq!(
            AnalyzerType::SysmexXnL.default_protocol(),
            WireProtocol::Astm
        );
        assert_eq!(
            AnalyzerType::MindrayBs430.default_protocol(),
            WireProtocol::Hl7
        );
        assert_eq!(
            AnalyzerType::RocheCobas.default_protocol(),
            WireProtocol::Astm
        );
    }

    #[test]
    fn analyzer_from_str_accepts_display_names() {
        assert_eq!(
            AnalyzerType::from_str("Mindray BS-430").unwrap(),
            AnalyzerType::MindrayBs430
        );
        assert_eq!(
            AnalyzerType::from_str("sysmex_xn_l").unwrap(),
            AnalyzerType::SysmexXnL
        );
        assert!(AnalyzerType::from_str("unknown-box").is_err());
    }

    #[test]
    fn sync_status_display() {
        assert_eq!(SyncStatus::Local.to_string(), "local");
        assert_eq!(SyncStatus::Poisoned.to_string(), "poisoned");
    }

    #[test]
    fn patient_identity_requires_one_id() {
        let mut p = NewPatient::default();
        assert!(!p.has_identity());
        p.internal_id = "322288".into();
        assert!(p.has_identity());
    }
}

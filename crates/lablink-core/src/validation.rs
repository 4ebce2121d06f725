//! # Validation Module
//!
//! Field validators backing `AppConfig::validate`. Kept as free functions
//! so the config editor (an external collaborator) can reuse them on
//! individual fields before a full save.

use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{ValidationError, ValidationResult};
use crate::types::ListenerSpec;

/// Validates a listener port. Zero is the only invalid u16 value; the
/// upper bound is enforced by the type.
pub fn validate_port(port: u16) -> ValidationResult<()> {
    if port == 0 {
        return Err(ValidationError::OutOfRange {
            field: "port".into(),
            reason: "must be between 1 and 65535".into(),
        });
    }
    Ok(())
}

/// Validates an instance identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits, hyphens and underscores only
pub fn validate_instance_id(id: &str) -> ValidationResult<()> {
    let id = id.trim();

    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "instance_id".into(),
        });
    }

    if id.len() > 64 {
        return Err(ValidationError::OutOfRange {
            field: "instance_id".into(),
            reason: "must be at most 64 characters".into(),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "instance_id".into(),
            reason: "must contain only letters, digits, hyphens and underscores".into(),
        });
    }

    Ok(())
}

/// Validates a standard 5-field cron expression.
pub fn validate_cron(expr: &str) -> ValidationResult<()> {
    // The cron crate expects a seconds field; prefix the 5-field form.
    let with_seconds = format!("0 {}", expr.trim());
    cron::Schedule::from_str(&with_seconds).map_err(|e| ValidationError::InvalidFormat {
        field: "cron_schedule".into(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Validates a listener set: every port valid, no duplicates, protocol
/// compatible with the analyzer.
pub fn validate_listeners(specs: &[ListenerSpec]) -> ValidationResult<()> {
    if specs.is_empty() {
        return Err(ValidationError::Required {
            field: "listeners".into(),
        });
    }

    let mut seen = HashSet::new();
    for spec in specs {
        validate_port(spec.port)?;

        if !seen.insert(spec.port) {
            return Err(ValidationError::Duplicate {
                field: "port".into(),
                value: spec.port.to_string(),
            });
        }

        // Every supported analyzer speaks its default protocol; Mindray
        // units additionally ship ASTM firmware, so only reject the
        // combinations no firmware offers.
        let default = spec.analyzer_type.default_protocol();
        if spec.protocol != default && spec.analyzer_type != crate::AnalyzerType::MindrayBs430 {
            return Err(ValidationError::InvalidFormat {
                field: "protocol".into(),
                reason: format!(
                    "{} speaks {} only",
                    spec.analyzer_type, default
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnalyzerType, WireProtocol};

    fn spec(port: u16, analyzer: AnalyzerType, protocol: WireProtocol) -> ListenerSpec {
        ListenerSpec {
            port,
            analyzer_type: analyzer,
            protocol,
            field_map_id: None,
        }
    }

    #[test]
    fn port_zero_rejected() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(5000).is_ok());
    }

    #[test]
    fn instance_id_rules() {
        assert!(validate_instance_id("XN-L-001").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("has spaces").is_err());
    }

    #[test]
    fn cron_five_field_form() {
        assert!(validate_cron("0 * * * *").is_ok());
        assert!(validate_cron("*/15 2 * * 1-5").is_ok());
        assert!(validate_cron("not a cron").is_err());
    }

    #[test]
    fn duplicate_ports_rejected() {
        let specs = vec![
            spec(5000, AnalyzerType::SysmexXnL, WireProtocol::Astm),
            spec(5000, AnalyzerType::MindrayBs430, WireProtocol::Hl7),
        ];
        assert_eq!(
            validate_listeners(&specs),
            Err(ValidationError::Duplicate {
                field: "port".into(),
                value: "5000".into()
            })
        );
    }

    #[test]
    fn incompatible_protocol_rejected() {
        let specs = vec![spec(5000, AnalyzerType::SysmexXnL, WireProtocol::Hl7)];
        assert!(validate_listeners(&specs).is_err());

        // Mindray accepts either protocol.
        let specs = vec![spec(5001, AnalyzerType::MindrayBs430, WireProtocol::Astm)];
        assert!(validate_listeners(&specs).is_ok());
    }
}

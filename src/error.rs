//! Custom error types for the assay sequencer.
//!
//! This module defines the primary error type, `AssayError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report the
//! conditions that can stop a run, from a bad configuration file to a tip rack
//! running dry halfway through a stage.
//!
//! ## Error Hierarchy
//!
//! - **`TipRackExhausted`**: the bound tip pool has no tip left for the active nozzle
//!   style. Fatal; the operator has to load fresh racks and restart.
//! - **`ConfigurationConflict`**: channels were reconfigured with a tip attached, or a
//!   tip rack sits on the wrong kind of mount for the requested nozzle style.
//! - **`VolumeInvariantViolation`**: a dispense would exceed the liquid held in the tip,
//!   an aspirate would overfill it, or a wash loop does not balance. Static checks catch
//!   these before the first hardware call; the runtime tracker is a second line.
//! - **`Instrument`**: anything the liquid-handler driver reports.
//! - **`Config`** / **`Configuration`**: figment load errors and semantic validation
//!   errors respectively.
//!
//! None of these are retried. Liquid that has been dispensed cannot be taken back, so
//! the sequencer halts at the point of failure and leaves recovery to the operator.

use crate::nozzle::NozzleStyle;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AssayResult<T> = std::result::Result<T, AssayError>;

/// Everything that can stop a run.
#[derive(Error, Debug)]
pub enum AssayError {
    /// The bound pool cannot serve another pick-up in the active style.
    #[error("Tip pool '{pool}' has no tips left for {style} pick-up")]
    TipRackExhausted {
        /// Pool name from the deck configuration.
        pool: String,
        /// Layout the pick-up was attempted with.
        style: NozzleStyle,
    },

    /// Reconfigured with a tip on, or a rack on the wrong mount.
    #[error("Nozzle configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// Static or runtime volume arithmetic failed.
    #[error("Volume invariant violated: {0}")]
    VolumeInvariantViolation(String),

    /// Pick-up requested with tips already on.
    #[error("A tip is already attached")]
    TipAlreadyAttached,

    /// Liquid handling or release requested without tips.
    #[error("No tip attached")]
    NoTipAttached,

    /// Pick-up requested before any layout was activated.
    #[error("No nozzle configuration is active")]
    NoActiveConfiguration,

    /// Transition refused by the run state machine.
    #[error("Stage order violation: {0}")]
    StageOrder(String),

    /// The operator refused a checkpoint.
    #[error("Run aborted by operator: {0}")]
    OperatorAbort(String),

    /// The liquid handler reported a failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A configuration source could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Console or report file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssayError {
    /// Shorthand for a volume bookkeeping failure.
    pub fn volume(message: impl Into<String>) -> Self {
        AssayError::VolumeInvariantViolation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AssayError::Instrument("gripper jammed".to_string());
        assert_eq!(err.to_string(), "Instrument error: gripper jammed");
    }

    #[test]
    fn test_tip_rack_exhausted_names_pool_and_style() {
        let err = AssayError::TipRackExhausted {
            pool: "aliquot".into(),
            style: NozzleStyle::ColumnPartial,
        };
        let text = err.to_string();
        assert!(text.contains("aliquot"));
        assert!(text.contains("column"));
    }

    #[test]
    fn test_volume_shorthand() {
        let err = AssayError::volume("dispense 40 µL exceeds 30 µL held");
        assert!(matches!(err, AssayError::VolumeInvariantViolation(_)));
    }
}

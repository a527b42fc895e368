//! Assay stages and the run state machine.
//!
//! ```text
//! PrewetAndAliquot ─► WashAndDetectionAntibody ─► StreptavidinPe ─► FinalWashResuspend ─► Done
//!        │                     │                        │                    │
//!        └─────────────────────┴──────── fatal error ───┴────────────────────┴─► Halted
//! ```
//!
//! Transitions only move forward, one stage at a time, and only once the
//! stage's terminal checkpoint has been acknowledged. `Halted` and `Done`
//! are absorbing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AssayError, AssayResult};

/// The four assay stages, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssayStage {
    /// Step 1: prewet, aliquots, distribution, beads.
    PrewetAndAliquot,
    /// Step 2: four washes, detection antibody.
    WashAndDetectionAntibody,
    /// Step 3: streptavidin-PE.
    StreptavidinPe,
    /// Step 4: three washes and the resuspension fill.
    FinalWashResuspend,
}

impl AssayStage {
    /// In run order.
    pub const ALL: [AssayStage; 4] = [
        AssayStage::PrewetAndAliquot,
        AssayStage::WashAndDetectionAntibody,
        AssayStage::StreptavidinPe,
        AssayStage::FinalWashResuspend,
    ];

    /// 1-based step number shown to the operator.
    pub fn number(&self) -> u8 {
        match self {
            AssayStage::PrewetAndAliquot => 1,
            AssayStage::WashAndDetectionAntibody => 2,
            AssayStage::StreptavidinPe => 3,
            AssayStage::FinalWashResuspend => 4,
        }
    }

    /// Following stage; `None` after the last.
    pub fn next(&self) -> Option<AssayStage> {
        match self {
            AssayStage::PrewetAndAliquot => Some(AssayStage::WashAndDetectionAntibody),
            AssayStage::WashAndDetectionAntibody => Some(AssayStage::StreptavidinPe),
            AssayStage::StreptavidinPe => Some(AssayStage::FinalWashResuspend),
            AssayStage::FinalWashResuspend => None,
        }
    }

    /// Whether the stage ends on an operator checkpoint. The final wash
    /// ends on a notification instead.
    pub fn has_terminal_gate(&self) -> bool {
        !matches!(self, AssayStage::FinalWashResuspend)
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssayStage::PrewetAndAliquot => "prewet & aliquot",
            AssayStage::WashAndDetectionAntibody => "wash & detection antibody",
            AssayStage::StreptavidinPe => "streptavidin-PE",
            AssayStage::FinalWashResuspend => "final wash & resuspend",
        }
    }
}

impl fmt::Display for AssayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Ready to execute this stage next.
    Stage {
        /// The pending stage.
        stage: AssayStage,
    },
    /// Every stage has completed.
    Done,
    /// Stopped by a fatal error during `stage`; needs manual recovery.
    Halted {
        /// Stage that was running.
        stage: AssayStage,
        /// The error, rendered.
        reason: String,
    },
}

impl RunState {
    /// Pending the first stage.
    pub fn initial() -> Self {
        RunState::Stage {
            stage: AssayStage::PrewetAndAliquot,
        }
    }

    /// Stage due to run next, if any.
    pub fn pending_stage(&self) -> Option<AssayStage> {
        match self {
            RunState::Stage { stage } => Some(*stage),
            _ => None,
        }
    }

    /// Whether every stage completed.
    pub fn is_done(&self) -> bool {
        matches!(self, RunState::Done)
    }

    /// Whether the run stopped on an error.
    pub fn is_halted(&self) -> bool {
        matches!(self, RunState::Halted { .. })
    }

    /// Guarded transition out of `stage`.
    ///
    /// Refused unless `self` is that stage and its terminal checkpoint has
    /// been acknowledged.
    pub fn after(&self, stage: AssayStage, terminal_gate_satisfied: bool) -> AssayResult<RunState> {
        match self {
            RunState::Stage { stage: current } if *current == stage => {}
            other => {
                return Err(AssayError::StageOrder(format!(
                    "cannot leave {stage} from state {other:?}"
                )))
            }
        }
        if !terminal_gate_satisfied {
            return Err(AssayError::StageOrder(format!(
                "{stage} terminal checkpoint not acknowledged"
            )));
        }
        Ok(match stage.next() {
            Some(next) => RunState::Stage { stage: next },
            None => RunState::Done,
        })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Stage { stage } => write!(f, "pending step {} ({stage})", stage.number()),
            RunState::Done => f.write_str("done"),
            RunState::Halted { stage, reason } => write!(f, "halted in {stage}: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain_reaches_done() {
        let mut state = RunState::initial();
        for stage in AssayStage::ALL {
            state = state.after(stage, true).unwrap();
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_no_skip_or_backward() {
        let state = RunState::initial();
        assert!(state.after(AssayStage::StreptavidinPe, true).is_err());

        let second = state.after(AssayStage::PrewetAndAliquot, true).unwrap();
        assert!(second.after(AssayStage::PrewetAndAliquot, true).is_err());
    }

    #[test]
    fn test_unsatisfied_gate_blocks() {
        let err = RunState::initial()
            .after(AssayStage::PrewetAndAliquot, false)
            .unwrap_err();
        assert!(matches!(err, AssayError::StageOrder(_)));
    }

    #[test]
    fn test_halted_and_done_absorb() {
        let halted = RunState::Halted {
            stage: AssayStage::StreptavidinPe,
            reason: "tips".into(),
        };
        assert!(halted.after(AssayStage::StreptavidinPe, true).is_err());
        assert!(RunState::Done
            .after(AssayStage::FinalWashResuspend, true)
            .is_err());
    }

    #[test]
    fn test_stage_order() {
        let mut sorted = AssayStage::ALL;
        sorted.sort();
        assert_eq!(sorted, AssayStage::ALL);
        assert_eq!(AssayStage::FinalWashResuspend.next(), None);
    }
}

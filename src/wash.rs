//! Wash-loop volume bookkeeping.
//!
//! A wash loop fills a wide-bore tip once, then repeatedly primes a little
//! back into the reservoir and dispenses the same volume into the four
//! anchors of group 0, topping the tip up between iterations. Whether the
//! tip always holds enough depends only on fixed volumes, so the whole loop
//! is simulated up front and a mismatch is rejected before any liquid moves.

use serde::{Deserialize, Serialize};

use crate::error::{AssayError, AssayResult};
use crate::transfer::{check_volume, VOLUME_EPSILON_UL};

/// Anchors dispensed per iteration.
pub const WELLS_PER_ITERATION: u32 = 4;

/// Smaller terminal fill that replaces the last wash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResuspendStep {
    /// Top-up aspirated after the last full wash.
    pub aspirate_ul: f64,
    /// Into each anchor; smaller than the wash volume.
    pub per_well_ul: f64,
}

/// Fixed volumes of a wash loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WashLoopPlan {
    /// Loop length, last iteration included.
    pub iterations: u32,
    /// Fill before the first iteration.
    pub initial_aspirate_ul: f64,
    /// Dispensed back into the reservoir at the start of each iteration.
    pub priming_ul: f64,
    /// Into each anchor per full wash.
    pub wash_per_well_ul: f64,
    /// Top-up between full washes.
    pub replenish_ul: f64,
    /// Replaces the last iteration with a resuspension fill.
    #[serde(default)]
    pub resuspend: Option<ResuspendStep>,
}

/// What an iteration does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationKind {
    /// Full wash, followed by a vacuum checkpoint.
    Wash,
    /// Terminal resuspension fill, followed by a notification only.
    Resuspend,
}

/// One planned iteration with the tip volume around it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WashIteration {
    /// 1-based.
    pub number: u32,
    /// Iterations in the loop.
    pub total: u32,
    /// Wash or resuspend.
    pub kind: IterationKind,
    /// Dispensed back into the reservoir first.
    pub priming_ul: f64,
    /// Into each of the four anchors.
    pub per_well_ul: f64,
    /// Aspirated after this iteration's dispenses, if any.
    pub refill_after_ul: Option<f64>,
    /// In the tip at the start of the iteration.
    pub held_before_ul: f64,
    /// After dispenses and refill.
    pub held_after_ul: f64,
}

impl WashIteration {
    /// Priming plus the four anchor dispenses.
    pub fn dispensed_ul(&self) -> f64 {
        self.priming_ul + self.per_well_ul * f64::from(WELLS_PER_ITERATION)
    }

    /// Whether this is the last iteration of the loop.
    pub fn is_last(&self) -> bool {
        self.number == self.total
    }
}

impl WashLoopPlan {
    /// Four 40 µL washes from a 180 µL fill, topped up with 170 µL.
    pub fn standard() -> Self {
        Self {
            iterations: 4,
            initial_aspirate_ul: 180.0,
            priming_ul: 10.0,
            wash_per_well_ul: 40.0,
            replenish_ul: 170.0,
            resuspend: None,
        }
    }

    /// Three washes, then a 20 µL per well resuspension fill.
    pub fn with_resuspend() -> Self {
        Self {
            resuspend: Some(ResuspendStep {
                aspirate_ul: 90.0,
                per_well_ul: 20.0,
            }),
            ..Self::standard()
        }
    }

    /// Iterations in order, with the tip volume before and after each.
    pub fn schedule(&self) -> Vec<WashIteration> {
        let mut held = self.initial_aspirate_ul;
        (1..=self.iterations)
            .map(|number| {
                let last = number == self.iterations;
                let (kind, per_well_ul) = match self.resuspend {
                    Some(step) if last => (IterationKind::Resuspend, step.per_well_ul),
                    _ => (IterationKind::Wash, self.wash_per_well_ul),
                };
                let refill_after_ul = match self.resuspend {
                    _ if last => None,
                    Some(step) if number + 1 == self.iterations => Some(step.aspirate_ul),
                    _ => Some(self.replenish_ul),
                };
                let held_before_ul = held;
                let mut iteration = WashIteration {
                    number,
                    total: self.iterations,
                    kind,
                    priming_ul: self.priming_ul,
                    per_well_ul,
                    refill_after_ul,
                    held_before_ul,
                    held_after_ul: 0.0,
                };
                held = held_before_ul - iteration.dispensed_ul() + refill_after_ul.unwrap_or(0.0);
                iteration.held_after_ul = held;
                iteration
            })
            .collect()
    }

    /// Liquid left in the tip once the loop finishes (blown out afterwards).
    pub fn residual_ul(&self) -> f64 {
        self.schedule()
            .last()
            .map(|it| it.held_after_ul)
            .unwrap_or(self.initial_aspirate_ul)
    }

    /// Simulate the loop against a tip of `tip_capacity_ul`.
    ///
    /// Every iteration must be covered by what the tip holds at its start,
    /// and no fill or top-up may exceed the tip.
    pub fn validate(&self, tip_capacity_ul: f64) -> AssayResult<()> {
        if self.iterations == 0 {
            return Err(AssayError::volume("wash loop needs at least one iteration"));
        }
        check_volume(self.initial_aspirate_ul, "wash initial aspirate")?;
        check_volume(self.priming_ul, "wash priming")?;
        check_volume(self.wash_per_well_ul, "wash per-well")?;
        check_volume(self.replenish_ul, "wash replenish")?;
        if self.wash_per_well_ul <= 0.0 {
            return Err(AssayError::volume("wash per-well volume must be positive"));
        }
        if let Some(step) = &self.resuspend {
            check_volume(step.aspirate_ul, "resuspend aspirate")?;
            check_volume(step.per_well_ul, "resuspend per-well")?;
            if step.per_well_ul <= 0.0 || step.per_well_ul >= self.wash_per_well_ul {
                return Err(AssayError::volume(format!(
                    "resuspend per-well {} µL must be above 0 and below the {} µL wash",
                    step.per_well_ul, self.wash_per_well_ul
                )));
            }
            if self.iterations < 2 {
                return Err(AssayError::volume(
                    "a resuspend loop needs at least one full wash before the final fill",
                ));
            }
        }
        if self.initial_aspirate_ul > tip_capacity_ul + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "initial wash aspirate {} µL exceeds {} µL tip",
                self.initial_aspirate_ul, tip_capacity_ul
            )));
        }

        for it in self.schedule() {
            let need = it.dispensed_ul();
            if need > it.held_before_ul + VOLUME_EPSILON_UL {
                return Err(AssayError::volume(format!(
                    "wash iteration {}/{} dispenses {need} µL but the tip holds {} µL",
                    it.number, it.total, it.held_before_ul
                )));
            }
            if it.held_after_ul > tip_capacity_ul + VOLUME_EPSILON_UL {
                return Err(AssayError::volume(format!(
                    "top-up after wash iteration {}/{} leaves {} µL in a {} µL tip",
                    it.number, it.total, it.held_after_ul, tip_capacity_ul
                )));
            }
        }
        Ok(())
    }
}

//! Pipetting primitives with volume bookkeeping.
//!
//! [`Pipette`] wraps a [`LiquidHandler`] together with the
//! [`NozzleResourceManager`] and the volume currently held in the tip. Every
//! primitive checks its volume arithmetic before the driver is called:
//!
//! - volumes are finite and never negative;
//! - an aspirate never overfills the tip;
//! - a dispense never exceeds what the tip holds. Leaving liquid behind is
//!   fine; overshooting is not.
//!
//! [`TransferPlan`] bundles the usual mix → aspirate → settle → pre-dispense
//! → dispense (+ touch-tip) sequence so it can be checked statically with
//! [`TransferPlan::validate`] before a run starts.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::driver::LiquidHandler;
use crate::error::{AssayError, AssayResult};
use crate::labware::{LabwareHandle, Location, WellName, WellPosition};
use crate::nozzle::{
    ActiveConfiguration, NozzleResourceManager, NozzleStyle, PoolId, ReleaseTarget, TipHandle,
};

/// Tolerance for floating-point volume comparisons, in µL.
pub const VOLUME_EPSILON_UL: f64 = 1e-6;

/// Touch-tip motion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchTip {
    /// Offset from the well top, negative is down.
    pub v_offset_mm: f64,
    /// Lateral speed.
    pub speed_mm_s: f64,
    /// Fraction of the well radius to travel, in (0, 1].
    pub radius: f64,
}

/// In-place mixing before an aspirate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixSpec {
    /// Number of aspirate/dispense cycles.
    pub repeats: u32,
    /// Volume of each cycle.
    pub volume_ul: f64,
}

/// One dispense of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DispenseStep {
    /// Leaves the tip.
    pub volume_ul: f64,
    /// Target well.
    pub at: WellPosition,
    /// Multiple of the default flow rate.
    pub rate: f64,
    /// Touch-tip right after this dispense.
    pub touch_tip: Option<TouchTip>,
}

/// Priming volume pushed back out before the real dispenses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreDispense {
    /// Leaves the tip.
    pub volume_ul: f64,
    /// Usually the source well.
    pub to: WellPosition,
}

/// A single tip-load of work.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    /// Where to aspirate.
    pub source: WellPosition,
    /// Filled once, before any dispense.
    pub aspirate_ul: f64,
    /// Multiple of the default flow rate.
    pub aspirate_rate: f64,
    /// Mix on the source right before the aspirate.
    pub mix: Option<MixSpec>,
    /// Wait after the aspirate.
    pub settle: Option<Duration>,
    /// Priming pushed back into the source before dispensing.
    pub pre_dispense: Option<PreDispense>,
    /// In order.
    pub dispenses: Vec<DispenseStep>,
    /// Blow-out target after the last dispense.
    pub blow_out: Option<Location>,
}

impl TransferPlan {
    /// Aspirate `aspirate_ul` from `source` at rate 1.0, nothing else yet.
    pub fn new(source: WellPosition, aspirate_ul: f64) -> Self {
        Self {
            source,
            aspirate_ul,
            aspirate_rate: 1.0,
            mix: None,
            settle: None,
            pre_dispense: None,
            dispenses: Vec::new(),
            blow_out: None,
        }
    }

    /// Override the default aspirate rate of 1.0.
    pub fn aspirate_rate(mut self, rate: f64) -> Self {
        self.aspirate_rate = rate;
        self
    }

    /// Mix the source before the aspirate.
    pub fn mix(mut self, mix: MixSpec) -> Self {
        self.mix = Some(mix);
        self
    }

    /// Wait after the aspirate.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    /// Prime `volume_ul` into `to` before the real dispenses.
    pub fn pre_dispense(mut self, volume_ul: f64, to: WellPosition) -> Self {
        self.pre_dispense = Some(PreDispense { volume_ul, to });
        self
    }

    /// Append a dispense.
    pub fn dispense(mut self, step: DispenseStep) -> Self {
        self.dispenses.push(step);
        self
    }

    /// Blow out into `to` when done.
    pub fn blow_out(mut self, to: Location) -> Self {
        self.blow_out = Some(to);
        self
    }

    /// Liquid that leaves the tip before any blow-out.
    pub fn dispensed_ul(&self) -> f64 {
        self.pre_dispense.map(|p| p.volume_ul).unwrap_or(0.0)
            + self.dispenses.iter().map(|d| d.volume_ul).sum::<f64>()
    }

    /// Check the plan's arithmetic against a tip of `tip_capacity_ul`.
    pub fn validate(&self, tip_capacity_ul: f64) -> AssayResult<()> {
        check_volume(self.aspirate_ul, "aspirate")?;
        if let Some(mix) = &self.mix {
            check_volume(mix.volume_ul, "mix")?;
            if mix.volume_ul > tip_capacity_ul + VOLUME_EPSILON_UL {
                return Err(AssayError::volume(format!(
                    "mix volume {} µL exceeds {} µL tip",
                    mix.volume_ul, tip_capacity_ul
                )));
            }
        }
        if let Some(pre) = &self.pre_dispense {
            check_volume(pre.volume_ul, "pre-dispense")?;
        }
        for step in &self.dispenses {
            check_volume(step.volume_ul, "dispense")?;
        }
        if self.aspirate_ul > tip_capacity_ul + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "aspirate {} µL exceeds {} µL tip",
                self.aspirate_ul, tip_capacity_ul
            )));
        }
        let out = self.dispensed_ul();
        if out > self.aspirate_ul + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "dispenses total {out} µL but only {} µL aspirated",
                self.aspirate_ul
            )));
        }
        Ok(())
    }
}

pub(crate) fn check_volume(volume_ul: f64, what: &str) -> AssayResult<()> {
    if !volume_ul.is_finite() || volume_ul < 0.0 {
        return Err(AssayError::volume(format!(
            "{what} volume must be a non-negative number, got {volume_ul}"
        )));
    }
    Ok(())
}

/// Running totals kept by the pipette.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipetteStats {
    /// Tip pick-ups.
    pub tips_picked_up: u32,
    /// Aspirate commands.
    pub aspirates: u32,
    /// Dispense commands, priming included.
    pub dispenses: u32,
    /// Total aspirated, in µL.
    pub aspirated_ul: f64,
    /// Total dispensed, in µL.
    pub dispensed_ul: f64,
}

/// The head, its nozzle bookkeeping and the liquid in its tips.
pub struct Pipette<D> {
    driver: D,
    nozzles: NozzleResourceManager,
    tip: Option<TipHandle>,
    held_ul: f64,
    stats: PipetteStats,
}

impl<D: LiquidHandler> Pipette<D> {
    /// Wrap `driver` with an empty nozzle manager.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            nozzles: NozzleResourceManager::new(),
            tip: None,
            held_ul: 0.0,
            stats: PipetteStats::default(),
        }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The wrapped driver, mutably.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Nozzle layout and tip pools.
    pub fn nozzles(&self) -> &NozzleResourceManager {
        &self.nozzles
    }

    /// Nozzle layout and tip pools, mutably.
    pub fn nozzles_mut(&mut self) -> &mut NozzleResourceManager {
        &mut self.nozzles
    }

    /// Volume currently in the tip.
    pub fn held_ul(&self) -> f64 {
        self.held_ul
    }

    /// Counters since construction.
    pub fn stats(&self) -> PipetteStats {
        self.stats
    }

    /// Whether a tip is attached.
    pub fn has_tip(&self) -> bool {
        self.tip.is_some()
    }

    fn tip_capacity(&self) -> AssayResult<f64> {
        self.tip
            .as_ref()
            .map(TipHandle::tip_volume_ul)
            .ok_or(AssayError::NoTipAttached)
    }

    /// Activate a layout, then tell the driver.
    pub async fn configure(
        &mut self,
        style: NozzleStyle,
        start: WellName,
        pool: PoolId,
    ) -> AssayResult<ActiveConfiguration> {
        let config = self.nozzles.activate(style, start, pool)?;
        self.driver
            .configure_channels(style, start, &config.tip_racks)
            .await?;
        Ok(config)
    }

    /// Refill the bound pool's racks.
    pub async fn reset_tips(&mut self) -> AssayResult<()> {
        self.nozzles.reset()?;
        let racks = self
            .nozzles
            .active()
            .map(|a| a.tip_racks.clone())
            .unwrap_or_default();
        self.driver.reset_tip_pool(&racks).await
    }

    /// Take the next tips of the active layout.
    pub async fn pick_up_tip(&mut self) -> AssayResult<()> {
        let handle = self.nozzles.pick_up()?;
        if let Err(e) = self.driver.pick_up_tip(&handle).await {
            // the tips never left the rack
            self.nozzles.release(handle, ReleaseTarget::ReturnToRack)?;
            return Err(e);
        }
        self.tip = Some(handle);
        self.held_ul = 0.0;
        self.stats.tips_picked_up += 1;
        Ok(())
    }

    /// Eject the tips into `trash`.
    pub async fn drop_tip(&mut self, trash: LabwareHandle) -> AssayResult<()> {
        let handle = self.tip.take().ok_or(AssayError::NoTipAttached)?;
        if let Err(e) = self.driver.drop_tip(trash).await {
            self.tip = Some(handle);
            return Err(e);
        }
        self.held_ul = 0.0;
        self.nozzles.release(handle, ReleaseTarget::Trash)
    }

    /// Put the tips back where they came from.
    pub async fn return_tip(&mut self) -> AssayResult<()> {
        let handle = self.tip.take().ok_or(AssayError::NoTipAttached)?;
        if let Err(e) = self.driver.return_tip().await {
            self.tip = Some(handle);
            return Err(e);
        }
        self.held_ul = 0.0;
        self.nozzles.release(handle, ReleaseTarget::ReturnToRack)
    }

    /// Aspirate, refusing to overfill the tip.
    pub async fn aspirate(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()> {
        check_volume(volume_ul, "aspirate")?;
        let capacity = self.tip_capacity()?;
        if self.held_ul + volume_ul > capacity + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "aspirating {volume_ul} µL onto {} µL held overfills the {capacity} µL tip",
                self.held_ul
            )));
        }
        trace!(volume_ul, well = %at.well, rate, "aspirate");
        self.driver.aspirate(volume_ul, at, rate).await?;
        self.held_ul += volume_ul;
        self.stats.aspirates += 1;
        self.stats.aspirated_ul += volume_ul;
        Ok(())
    }

    /// Dispense, refusing to go below empty.
    pub async fn dispense(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()> {
        check_volume(volume_ul, "dispense")?;
        self.tip_capacity()?;
        if volume_ul > self.held_ul + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "dispensing {volume_ul} µL but only {} µL held",
                self.held_ul
            )));
        }
        trace!(volume_ul, well = %at.well, rate, "dispense");
        self.driver.dispense(volume_ul, at, rate).await?;
        self.held_ul = (self.held_ul - volume_ul).max(0.0);
        self.stats.dispenses += 1;
        self.stats.dispensed_ul += volume_ul;
        Ok(())
    }

    /// Mix in place with an empty tip, right before the aspirate that
    /// consumes the mixed reagent.
    pub async fn mix(&mut self, mix: &MixSpec, at: &WellPosition) -> AssayResult<()> {
        check_volume(mix.volume_ul, "mix")?;
        let capacity = self.tip_capacity()?;
        if self.held_ul > VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "cannot mix with {} µL still held in the tip",
                self.held_ul
            )));
        }
        if self.held_ul + mix.volume_ul > capacity + VOLUME_EPSILON_UL {
            return Err(AssayError::volume(format!(
                "mixing {} µL with {} µL held overfills the {capacity} µL tip",
                mix.volume_ul, self.held_ul
            )));
        }
        self.driver.mix(mix.repeats, mix.volume_ul, at).await
    }

    /// Touch-tip on the last well visited.
    pub async fn touch_tip(&mut self, touch: &TouchTip) -> AssayResult<()> {
        self.tip_capacity()?;
        self.driver.touch_tip(touch).await
    }

    /// Empty the tip completely.
    pub async fn blow_out(&mut self, to: &Location) -> AssayResult<()> {
        self.tip_capacity()?;
        self.driver.blow_out(to).await?;
        self.held_ul = 0.0;
        Ok(())
    }

    /// Wait without moving.
    pub async fn delay(&mut self, duration: Duration) -> AssayResult<()> {
        self.driver.delay(duration).await
    }

    /// Run a whole plan on the attached tip.
    pub async fn transfer(&mut self, plan: &TransferPlan) -> AssayResult<()> {
        plan.validate(self.tip_capacity()?)?;
        debug!(
            source = %plan.source.well,
            aspirate_ul = plan.aspirate_ul,
            dispenses = plan.dispenses.len(),
            "transfer"
        );

        if let Some(mix) = &plan.mix {
            self.mix(mix, &plan.source).await?;
        }
        self.aspirate(plan.aspirate_ul, &plan.source, plan.aspirate_rate)
            .await?;
        if let Some(settle) = plan.settle {
            self.delay(settle).await?;
        }
        if let Some(pre) = &plan.pre_dispense {
            self.dispense(pre.volume_ul, &pre.to, 1.0).await?;
        }
        for step in &plan.dispenses {
            self.dispense(step.volume_ul, &step.at, step.rate).await?;
            if let Some(touch) = &step.touch_tip {
                self.touch_tip(touch).await?;
            }
        }
        if let Some(to) = &plan.blow_out {
            self.blow_out(to).await?;
        }
        Ok(())
    }
}

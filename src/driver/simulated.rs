//! Simulated liquid handler.
//!
//! Records every command it receives and enforces the physical rules a real
//! deck would: labware must be loaded before use, a slot holds one piece of
//! labware, and liquid can only be moved with tips on.
//!
//! Delays are skipped by default. Give a positive time scale to sleep for a
//! fraction of the requested duration (uses `tokio::time::sleep`, never
//! `std::thread::sleep`).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};

use super::LiquidHandler;
use crate::error::{AssayError, AssayResult};
use crate::labware::{
    LabwareHandle, LabwareRole, LabwareSpec, Location, PlateFormat, WellName, WellPosition,
};
use crate::nozzle::{NozzleStyle, TipHandle};
use crate::transfer::TouchTip;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum DriverCommand {
    /// `load_labware` / `load_trash`
    LoadLabware {
        handle: LabwareHandle,
        label: String,
        slot: String,
    },
    /// `configure_channels`
    ConfigureChannels {
        style: NozzleStyle,
        start: WellName,
        tip_racks: Vec<LabwareHandle>,
    },
    /// `pick_up_tip`, with the 1-based rack columns taken.
    PickUpTip {
        rack: LabwareHandle,
        columns: Vec<u8>,
    },
    /// Tips ejected into the trash.
    DropTip,
    /// Tips put back in their rack.
    ReturnTip,
    /// `reset_tip_pool`
    ResetTipPool {
        tip_racks: Vec<LabwareHandle>,
    },
    /// `aspirate`
    Aspirate {
        volume_ul: f64,
        labware: LabwareHandle,
        well: WellName,
        bottom_offset_mm: Option<f64>,
        rate: f64,
    },
    /// `dispense`
    Dispense {
        volume_ul: f64,
        labware: LabwareHandle,
        well: WellName,
        bottom_offset_mm: Option<f64>,
        rate: f64,
    },
    /// `mix`
    Mix {
        repeats: u32,
        volume_ul: f64,
        labware: LabwareHandle,
        well: WellName,
    },
    /// `touch_tip`
    TouchTip(TouchTip),
    /// `blow_out`, into the trash or a well.
    BlowOut {
        into_trash: bool,
    },
    /// `delay`, as requested (before time scaling).
    Delay(Duration),
}

/// In-memory stand-in for a 96-channel Flex.
#[derive(Debug, Default)]
pub struct SimulatedFlex {
    labware: BTreeMap<LabwareHandle, LabwareSpec>,
    next_handle: u32,
    tips_on: bool,
    commands: Vec<DriverCommand>,
    time_scale: f64,
    fail_at: Option<usize>,
}

impl SimulatedFlex {
    /// Empty deck, no delays, no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `scale` × each requested delay. `0.0` skips delays.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Make the `n`-th command (0-based) fail with an instrument error.
    pub fn with_fault_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Every command accepted so far, in order.
    pub fn commands(&self) -> &[DriverCommand] {
        &self.commands
    }

    /// Spec of a loaded labware.
    pub fn labware(&self, handle: LabwareHandle) -> Option<&LabwareSpec> {
        self.labware.get(&handle)
    }

    /// Handle of the labware loaded under `label`.
    pub fn handle_for(&self, label: &str) -> Option<LabwareHandle> {
        self.labware
            .iter()
            .find(|(_, spec)| spec.label == label)
            .map(|(handle, _)| *handle)
    }

    /// Whether tips are on the head.
    pub fn tips_on(&self) -> bool {
        self.tips_on
    }

    /// `(labware, well, volume)` for every dispense, in order.
    pub fn dispenses(&self) -> impl Iterator<Item = (LabwareHandle, WellName, f64)> + '_ {
        self.commands.iter().filter_map(|c| match c {
            DriverCommand::Dispense {
                labware,
                well,
                volume_ul,
                ..
            } => Some((*labware, *well, *volume_ul)),
            _ => None,
        })
    }

    fn record(&mut self, command: DriverCommand) -> AssayResult<()> {
        if self.fail_at == Some(self.commands.len()) {
            return Err(AssayError::Instrument(format!(
                "simulated fault on command #{}: {command:?}",
                self.commands.len()
            )));
        }
        trace!(?command, "SimulatedFlex");
        self.commands.push(command);
        Ok(())
    }

    fn check_well(&self, at: &WellPosition) -> AssayResult<()> {
        let spec = self.labware.get(&at.well.labware).ok_or_else(|| {
            AssayError::Instrument(format!("{} is not loaded", at.well.labware))
        })?;
        if !spec.format.contains(at.well.name) {
            return Err(AssayError::Instrument(format!(
                "well {} does not exist on '{}'",
                at.well.name, spec.label
            )));
        }
        Ok(())
    }

    fn require_tips(&self, action: &str) -> AssayResult<()> {
        if self.tips_on {
            Ok(())
        } else {
            Err(AssayError::Instrument(format!("cannot {action} without tips")))
        }
    }
}

#[async_trait]
impl LiquidHandler for SimulatedFlex {
    async fn load_labware(&mut self, spec: &LabwareSpec) -> AssayResult<LabwareHandle> {
        if let Some(occupant) = self.labware.values().find(|l| l.slot == spec.slot) {
            return Err(AssayError::Instrument(format!(
                "slot {} already holds '{}'",
                spec.slot, occupant.label
            )));
        }
        let handle = LabwareHandle(self.next_handle);
        self.record(DriverCommand::LoadLabware {
            handle,
            label: spec.label.clone(),
            slot: spec.slot.clone(),
        })?;
        self.next_handle += 1;
        self.labware.insert(handle, spec.clone());
        debug!(label = %spec.label, slot = %spec.slot, %handle, "SimulatedFlex: labware loaded");
        Ok(handle)
    }

    async fn load_trash(&mut self, slot: &str) -> AssayResult<LabwareHandle> {
        self.load_labware(&LabwareSpec {
            kind: "opentrons_1_trash_3200ml_fixed".into(),
            slot: slot.into(),
            label: "trash".into(),
            role: LabwareRole::Trash,
            format: PlateFormat::RESERVOIR_1,
            adapter: None,
        })
        .await
    }

    async fn configure_channels(
        &mut self,
        style: NozzleStyle,
        start: WellName,
        tip_racks: &[LabwareHandle],
    ) -> AssayResult<()> {
        if self.tips_on {
            return Err(AssayError::Instrument(
                "nozzle layout changed with tips attached".into(),
            ));
        }
        for rack in tip_racks {
            match self.labware.get(rack) {
                Some(spec) if spec.role == LabwareRole::TipRack => {}
                _ => {
                    return Err(AssayError::Instrument(format!(
                        "{rack} is not a loaded tip rack"
                    )))
                }
            }
        }
        self.record(DriverCommand::ConfigureChannels {
            style,
            start,
            tip_racks: tip_racks.to_vec(),
        })
    }

    async fn pick_up_tip(&mut self, tip: &TipHandle) -> AssayResult<()> {
        if self.tips_on {
            return Err(AssayError::Instrument("tips already attached".into()));
        }
        if !self.labware.contains_key(&tip.rack()) {
            return Err(AssayError::Instrument(format!("{} is not loaded", tip.rack())));
        }
        self.record(DriverCommand::PickUpTip {
            rack: tip.rack(),
            columns: tip.columns().to_vec(),
        })?;
        self.tips_on = true;
        Ok(())
    }

    async fn drop_tip(&mut self, trash: LabwareHandle) -> AssayResult<()> {
        self.require_tips("drop tips")?;
        match self.labware.get(&trash) {
            Some(spec) if spec.role == LabwareRole::Trash => {}
            _ => return Err(AssayError::Instrument(format!("{trash} is not a trash bin"))),
        }
        self.record(DriverCommand::DropTip)?;
        self.tips_on = false;
        Ok(())
    }

    async fn return_tip(&mut self) -> AssayResult<()> {
        self.require_tips("return tips")?;
        self.record(DriverCommand::ReturnTip)?;
        self.tips_on = false;
        Ok(())
    }

    async fn reset_tip_pool(&mut self, tip_racks: &[LabwareHandle]) -> AssayResult<()> {
        self.record(DriverCommand::ResetTipPool {
            tip_racks: tip_racks.to_vec(),
        })
    }

    async fn aspirate(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()> {
        self.require_tips("aspirate")?;
        self.check_well(at)?;
        self.record(DriverCommand::Aspirate {
            volume_ul,
            labware: at.well.labware,
            well: at.well.name,
            bottom_offset_mm: at.bottom_offset_mm,
            rate,
        })
    }

    async fn dispense(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()> {
        self.require_tips("dispense")?;
        self.check_well(at)?;
        self.record(DriverCommand::Dispense {
            volume_ul,
            labware: at.well.labware,
            well: at.well.name,
            bottom_offset_mm: at.bottom_offset_mm,
            rate,
        })
    }

    async fn mix(&mut self, repeats: u32, volume_ul: f64, at: &WellPosition) -> AssayResult<()> {
        self.require_tips("mix")?;
        self.check_well(at)?;
        self.record(DriverCommand::Mix {
            repeats,
            volume_ul,
            labware: at.well.labware,
            well: at.well.name,
        })
    }

    async fn touch_tip(&mut self, touch: &TouchTip) -> AssayResult<()> {
        self.require_tips("touch tip")?;
        self.record(DriverCommand::TouchTip(*touch))
    }

    async fn blow_out(&mut self, to: &Location) -> AssayResult<()> {
        self.require_tips("blow out")?;
        let into_trash = match to {
            Location::Trash(_) => true,
            Location::Well(at) => {
                self.check_well(at)?;
                false
            }
        };
        self.record(DriverCommand::BlowOut { into_trash })
    }

    async fn delay(&mut self, duration: Duration) -> AssayResult<()> {
        self.record(DriverCommand::Delay(duration))?;
        if self.time_scale > 0.0 {
            sleep(duration.mul_f64(self.time_scale)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::Well;

    fn plate_spec(slot: &str) -> LabwareSpec {
        LabwareSpec {
            kind: "agilent_384_wellplate_140ul".into(),
            slot: slot.into(),
            label: format!("plate@{slot}"),
            role: LabwareRole::DestinationPlate,
            format: PlateFormat::WELLS_384,
            adapter: None,
        }
    }

    #[tokio::test]
    async fn test_slot_collision_rejected() {
        let mut flex = SimulatedFlex::new();
        flex.load_labware(&plate_spec("D1")).await.unwrap();
        assert!(flex.load_labware(&plate_spec("D1")).await.is_err());
        assert!(flex.load_labware(&plate_spec("D2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_liquid_moves_need_tips() {
        let mut flex = SimulatedFlex::new();
        let plate = flex.load_labware(&plate_spec("D1")).await.unwrap();
        let at = Well::new(plate, "A1".parse().unwrap()).bottom(1.2);
        let err = flex.aspirate(10.0, &at, 1.0).await.unwrap_err();
        assert!(err.to_string().contains("without tips"));
        assert!(flex.commands().len() == 1);
    }

    #[tokio::test]
    async fn test_unknown_well_rejected() {
        let mut flex = SimulatedFlex::new();
        let plate = flex.load_labware(&plate_spec("D1")).await.unwrap();
        flex.tips_on = true;
        let at = Well::new(plate, "Q1".parse().unwrap()).default_position();
        assert!(flex.dispense(5.0, &at, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_needs_trash() {
        let mut flex = SimulatedFlex::new();
        let plate = flex.load_labware(&plate_spec("D1")).await.unwrap();
        let trash = flex.load_trash("A3").await.unwrap();
        flex.tips_on = true;
        assert!(flex.drop_tip(plate).await.is_err());
        flex.drop_tip(trash).await.unwrap();
        assert!(!flex.tips_on());
        assert_eq!(flex.handle_for("trash"), Some(trash));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let mut flex = SimulatedFlex::new().with_fault_at(1);
        flex.load_labware(&plate_spec("D1")).await.unwrap();
        let err = flex.load_labware(&plate_spec("D2")).await.unwrap_err();
        assert!(matches!(err, AssayError::Instrument(_)));
        assert!(flex.handle_for("plate@D2").is_none());
    }

    #[tokio::test]
    async fn test_delay_skipped_without_time_scale() {
        let mut flex = SimulatedFlex::new();
        let started = std::time::Instant::now();
        flex.delay(Duration::from_secs(30)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(flex.commands(), &[DriverCommand::Delay(Duration::from_secs(30))]);
    }
}

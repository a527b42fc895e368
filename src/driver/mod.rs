//! Liquid-handler capability interface.
//!
//! Hardware-agnostic trait the sequencer drives. A real robot binding lives
//! outside this crate; [`SimulatedFlex`] is provided for dry runs and tests.
//!
//! ## Contract
//! - Every call completes before it returns. The core never issues two
//!   commands concurrently.
//! - Volumes are in µL, heights in mm, rates are multiples of the default
//!   flow rate.
//! - Tip bookkeeping (which column, which rack) is decided by the caller and
//!   passed in; the driver only moves.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AssayResult;
use crate::labware::{LabwareHandle, LabwareSpec, Location, WellName, WellPosition};
use crate::nozzle::{NozzleStyle, TipHandle};
use crate::transfer::TouchTip;

pub mod simulated;

pub use simulated::{DriverCommand, SimulatedFlex};

/// Capability set of a 96-channel liquid handler.
#[async_trait]
pub trait LiquidHandler: Send {
    /// Place labware (plate, reservoir, tip rack or trash) in a deck slot.
    async fn load_labware(&mut self, spec: &LabwareSpec) -> AssayResult<LabwareHandle>;

    /// Fixed trash bin in `slot`.
    async fn load_trash(&mut self, slot: &str) -> AssayResult<LabwareHandle>;

    /// Change the active channel set and the racks later pick-ups draw from.
    async fn configure_channels(
        &mut self,
        style: NozzleStyle,
        start: WellName,
        tip_racks: &[LabwareHandle],
    ) -> AssayResult<()>;

    /// Pick up the tips described by `tip`.
    async fn pick_up_tip(&mut self, tip: &TipHandle) -> AssayResult<()>;

    /// Eject the attached tips into `trash`.
    async fn drop_tip(&mut self, trash: LabwareHandle) -> AssayResult<()>;

    /// Put the attached tips back where they were picked up.
    async fn return_tip(&mut self) -> AssayResult<()>;

    /// Tell the driver the given racks have been physically refilled.
    async fn reset_tip_pool(&mut self, tip_racks: &[LabwareHandle]) -> AssayResult<()>;

    /// Draw `volume_ul` into the tips at `at`.
    async fn aspirate(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()>;

    /// Push `volume_ul` out of the tips at `at`.
    async fn dispense(&mut self, volume_ul: f64, at: &WellPosition, rate: f64) -> AssayResult<()>;

    /// Aspirate and dispense `volume_ul` in place `repeats` times.
    async fn mix(&mut self, repeats: u32, volume_ul: f64, at: &WellPosition) -> AssayResult<()>;

    /// Brush the tip against the wall of the last well visited.
    async fn touch_tip(&mut self, touch: &TouchTip) -> AssayResult<()>;

    /// Expel everything left in the tips.
    async fn blow_out(&mut self, to: &Location) -> AssayResult<()>;

    /// Fixed settle time (bubbles, droplets).
    async fn delay(&mut self, duration: Duration) -> AssayResult<()>;
}

//! Nozzle layout and tip-rack bookkeeping.
//!
//! The 96-channel head runs in one of two layouts: every channel at once
//! (full plate) or a single 8-channel column. The layout decides how many
//! tips a pick-up takes from a rack, so the manager tracks rack consumption
//! column by column and hands out [`TipHandle`]s that must be released
//! before the layout may change.
//!
//! This module is pure bookkeeping. [`crate::transfer::Pipette`] pairs each
//! successful call with the matching driver command.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::error::{AssayError, AssayResult};
use crate::labware::{LabwareHandle, WellName};

/// Tip columns in a 96 rack.
pub const RACK_COLUMNS: u8 = 12;
/// Tips per rack column.
pub const TIPS_PER_COLUMN: usize = 8;

/// Active channel set of the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NozzleStyle {
    /// All 96 channels.
    FullPlate,
    /// One 8-channel column.
    ColumnPartial,
}

impl NozzleStyle {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NozzleStyle::FullPlate => "full-plate",
            NozzleStyle::ColumnPartial => "column-partial",
        }
    }
}

impl fmt::Display for NozzleStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical rack description used when registering a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TipRack {
    /// Handle from the driver.
    pub labware: LabwareHandle,
    /// Name in logs.
    pub label: String,
    /// Capacity of each tip.
    pub tip_volume_ul: f64,
    /// Mounted on the 96-channel adapter (required for full-plate pick-up).
    pub on_adapter: bool,
}

#[derive(Debug, Clone)]
struct RackState {
    rack: TipRack,
    // index 0 is column 1
    available: [bool; RACK_COLUMNS as usize],
}

impl RackState {
    fn new(rack: TipRack) -> Self {
        Self {
            rack,
            available: [true; RACK_COLUMNS as usize],
        }
    }

    fn is_full(&self) -> bool {
        self.available.iter().all(|a| *a)
    }

    fn remaining_columns(&self) -> usize {
        self.available.iter().filter(|a| **a).count()
    }

    fn refill(&mut self) {
        self.available = [true; RACK_COLUMNS as usize];
    }

    fn set_columns(&mut self, columns: &[u8], available: bool) {
        for col in columns {
            self.available[(*col - 1) as usize] = available;
        }
    }
}

#[derive(Debug, Clone)]
struct TipPool {
    name: String,
    racks: Vec<RackState>,
}

/// Index of a registered tip pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(usize);

/// The live nozzle layout and the pool it draws from.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConfiguration {
    /// Nozzle layout.
    pub style: NozzleStyle,
    /// Start channel, `A1` or `A12`.
    pub start: WellName,
    /// Pool the layout draws tips from.
    pub pool: PoolId,
    /// Racks of the bound pool.
    pub tip_racks: Vec<LabwareHandle>,
}

/// Tips currently on the head.
///
/// Deliberately not `Clone`: releasing consumes the handle, so the same
/// tips cannot be dropped twice.
#[derive(Debug, PartialEq)]
pub struct TipHandle {
    pool: PoolId,
    rack_index: usize,
    rack: LabwareHandle,
    columns: Vec<u8>,
    style: NozzleStyle,
    tip_volume_ul: f64,
}

impl TipHandle {
    /// Rack the tips came from.
    pub fn rack(&self) -> LabwareHandle {
        self.rack
    }

    /// Rack columns the tips came from, 1-based.
    pub fn columns(&self) -> &[u8] {
        &self.columns
    }

    /// Layout the tips were picked up with.
    pub fn style(&self) -> NozzleStyle {
        self.style
    }

    /// Capacity of each tip.
    pub fn tip_volume_ul(&self) -> f64 {
        self.tip_volume_ul
    }

    /// Rack well under the head's primary channel during pick-up.
    pub fn pick_up_well(&self) -> WellName {
        let column = self.columns.first().copied().unwrap_or(1);
        WellName::from_indices(0, column)
    }

    /// Number of tips on the head.
    pub fn tip_count(&self) -> usize {
        self.columns.len() * TIPS_PER_COLUMN
    }
}

/// Where released tips go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTarget {
    /// Tips are used up.
    Trash,
    /// Tips go back to the columns they came from.
    ReturnToRack,
}

/// Tracks nozzle layout, tip pools and the tip currently attached.
#[derive(Debug, Default)]
pub struct NozzleResourceManager {
    pools: Vec<TipPool>,
    active: Option<ActiveConfiguration>,
    tip_attached: bool,
}

impl NozzleResourceManager {
    /// No pools and no layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named pool of racks. All racks start full.
    pub fn register_pool(&mut self, name: impl Into<String>, racks: Vec<TipRack>) -> PoolId {
        let name = name.into();
        debug!(pool = %name, racks = racks.len(), "Registering tip pool");
        self.pools.push(TipPool {
            name,
            racks: racks.into_iter().map(RackState::new).collect(),
        });
        PoolId(self.pools.len() - 1)
    }

    /// Look a pool up by name.
    pub fn pool_id(&self, name: &str) -> Option<PoolId> {
        self.pools.iter().position(|p| p.name == name).map(PoolId)
    }

    /// Name of `id`, or `?` if unknown.
    pub fn pool_name(&self, id: PoolId) -> &str {
        self.pools.get(id.0).map(|p| p.name.as_str()).unwrap_or("?")
    }

    /// The live configuration, if any.
    pub fn active(&self) -> Option<&ActiveConfiguration> {
        self.active.as_ref()
    }

    /// Whether tips are on the head.
    pub fn tip_attached(&self) -> bool {
        self.tip_attached
    }

    /// Tips left in a pool.
    pub fn remaining_tips(&self, id: PoolId) -> usize {
        self.pools
            .get(id.0)
            .map(|p| {
                p.racks
                    .iter()
                    .map(|r| r.remaining_columns() * TIPS_PER_COLUMN)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Switch the head to `style`, drawing tips from `pool`.
    ///
    /// Fails with `ConfigurationConflict` while tips are attached, for a start
    /// channel the layout cannot use, or when a rack's mount does not suit the
    /// layout (full-plate pick-up needs the adapter, column pick-up must not
    /// use it).
    pub fn activate(
        &mut self,
        style: NozzleStyle,
        start: WellName,
        pool: PoolId,
    ) -> AssayResult<ActiveConfiguration> {
        if self.tip_attached {
            return Err(AssayError::ConfigurationConflict(format!(
                "cannot switch to {style} layout with tips attached"
            )));
        }
        let tip_pool = self
            .pools
            .get(pool.0)
            .ok_or_else(|| AssayError::ConfigurationConflict("unknown tip pool".into()))?;

        let start_ok = match style {
            NozzleStyle::FullPlate => start.row_index() == 0 && start.column() == 1,
            NozzleStyle::ColumnPartial => {
                start.row_index() == 0 && (start.column() == 1 || start.column() == RACK_COLUMNS)
            }
        };
        if !start_ok {
            return Err(AssayError::ConfigurationConflict(format!(
                "{style} layout cannot start at {start}"
            )));
        }

        let needs_adapter = style == NozzleStyle::FullPlate;
        if let Some(bad) = tip_pool
            .racks
            .iter()
            .find(|r| r.rack.on_adapter != needs_adapter)
        {
            return Err(AssayError::ConfigurationConflict(format!(
                "rack '{}' in pool '{}' {} the 96-channel adapter for {style} pick-up",
                bad.rack.label,
                tip_pool.name,
                if needs_adapter { "is not on" } else { "must not sit on" },
            )));
        }

        let config = ActiveConfiguration {
            style,
            start,
            pool,
            tip_racks: tip_pool.racks.iter().map(|r| r.rack.labware).collect(),
        };
        info!(style = %style, start = %start, pool = %tip_pool.name, "Nozzle layout activated");
        self.active = Some(config.clone());
        Ok(config)
    }

    /// Take the next tips for the active layout.
    pub fn pick_up(&mut self) -> AssayResult<TipHandle> {
        if self.tip_attached {
            return Err(AssayError::TipAlreadyAttached);
        }
        let active = self.active.as_ref().ok_or(AssayError::NoActiveConfiguration)?;
        let pool = &mut self.pools[active.pool.0];

        let picked = match active.style {
            NozzleStyle::FullPlate => pool
                .racks
                .iter()
                .position(RackState::is_full)
                .map(|idx| (idx, (1..=RACK_COLUMNS).collect::<Vec<_>>())),
            NozzleStyle::ColumnPartial => {
                // Starting on the left nozzle column keeps the idle nozzles
                // over empty space, so tips are taken from the right first.
                let order: Vec<u8> = if active.start.column() == 1 {
                    (1..=RACK_COLUMNS).rev().collect()
                } else {
                    (1..=RACK_COLUMNS).collect()
                };
                pool.racks.iter().enumerate().find_map(|(idx, rack)| {
                    order
                        .iter()
                        .find(|col| rack.available[(**col - 1) as usize])
                        .map(|col| (idx, vec![*col]))
                })
            }
        };

        let (rack_index, columns) = picked.ok_or_else(|| AssayError::TipRackExhausted {
            pool: pool.name.clone(),
            style: active.style,
        })?;

        let rack = &mut pool.racks[rack_index];
        rack.set_columns(&columns, false);
        self.tip_attached = true;
        debug!(pool = %pool.name, rack = %rack.rack.label, columns = ?columns, "Tips picked up");

        Ok(TipHandle {
            pool: active.pool,
            rack_index,
            rack: rack.rack.labware,
            columns,
            style: active.style,
            tip_volume_ul: rack.rack.tip_volume_ul,
        })
    }

    /// Give the attached tips back, either to the trash or to their rack slots.
    pub fn release(&mut self, handle: TipHandle, target: ReleaseTarget) -> AssayResult<()> {
        if !self.tip_attached {
            return Err(AssayError::NoTipAttached);
        }
        if target == ReleaseTarget::ReturnToRack {
            let rack = self
                .pools
                .get_mut(handle.pool.0)
                .and_then(|p| p.racks.get_mut(handle.rack_index))
                .ok_or_else(|| AssayError::ConfigurationConflict("tip handle from unknown rack".into()))?;
            rack.set_columns(&handle.columns, true);
        }
        self.tip_attached = false;
        debug!(columns = ?handle.columns, ?target, "Tips released");
        Ok(())
    }

    /// Mark every rack of the bound pool full again.
    pub fn reset(&mut self) -> AssayResult<()> {
        let pool = self.active.as_ref().ok_or(AssayError::NoActiveConfiguration)?.pool;
        self.reset_pool(pool);
        Ok(())
    }

    /// Mark every rack of `id` full again.
    pub fn reset_pool(&mut self, id: PoolId) {
        if let Some(pool) = self.pools.get_mut(id.0) {
            info!(pool = %pool.name, "Tip pool reset");
            pool.racks.iter_mut().for_each(RackState::refill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rack(id: u32, on_adapter: bool) -> TipRack {
        TipRack {
            labware: LabwareHandle(id),
            label: format!("rack{id}"),
            tip_volume_ul: 50.0,
            on_adapter,
        }
    }

    fn a(col: u8) -> WellName {
        WellName::new('A', col).unwrap()
    }

    #[test]
    fn test_column_pick_up_exhausts_after_twelve() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("aliquot", vec![rack(1, false)]);
        mgr.activate(NozzleStyle::ColumnPartial, a(1), pool).unwrap();

        for expected_col in (1..=12).rev() {
            let tip = mgr.pick_up().unwrap();
            assert_eq!(tip.columns(), &[expected_col]);
            mgr.release(tip, ReleaseTarget::Trash).unwrap();
        }
        assert_eq!(mgr.remaining_tips(pool), 0);
        assert!(matches!(
            mgr.pick_up(),
            Err(AssayError::TipRackExhausted { .. })
        ));

        mgr.reset().unwrap();
        assert_eq!(mgr.remaining_tips(pool), 96);
        assert!(mgr.pick_up().is_ok());
    }

    #[test]
    fn test_a12_start_takes_left_columns_first() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("detection", vec![rack(1, false)]);
        mgr.activate(NozzleStyle::ColumnPartial, a(12), pool).unwrap();
        let tip = mgr.pick_up().unwrap();
        assert_eq!(tip.columns(), &[1]);
        assert_eq!(tip.pick_up_well(), a(1));
    }

    #[test]
    fn test_full_plate_needs_full_rack() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("wash", vec![rack(1, true)]);
        mgr.activate(NozzleStyle::FullPlate, a(1), pool).unwrap();
        let tip = mgr.pick_up().unwrap();
        assert_eq!(tip.tip_count(), 96);
        mgr.release(tip, ReleaseTarget::Trash).unwrap();
        assert!(matches!(
            mgr.pick_up(),
            Err(AssayError::TipRackExhausted { .. })
        ));
    }

    #[test]
    fn test_return_to_rack_restores_tips() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("wash", vec![rack(1, true)]);
        mgr.activate(NozzleStyle::FullPlate, a(1), pool).unwrap();
        let tip = mgr.pick_up().unwrap();
        mgr.release(tip, ReleaseTarget::ReturnToRack).unwrap();
        assert_eq!(mgr.remaining_tips(pool), 96);
        assert!(mgr.pick_up().is_ok());
    }

    #[test]
    fn test_reconfigure_with_tip_attached_conflicts() {
        let mut mgr = NozzleResourceManager::new();
        let wash = mgr.register_pool("wash", vec![rack(1, true)]);
        let aliquot = mgr.register_pool("aliquot", vec![rack(2, false)]);
        mgr.activate(NozzleStyle::FullPlate, a(1), wash).unwrap();
        let tip = mgr.pick_up().unwrap();

        let err = mgr
            .activate(NozzleStyle::ColumnPartial, a(1), aliquot)
            .unwrap_err();
        assert!(matches!(err, AssayError::ConfigurationConflict(_)));

        mgr.release(tip, ReleaseTarget::ReturnToRack).unwrap();
        assert!(mgr.activate(NozzleStyle::ColumnPartial, a(1), aliquot).is_ok());
    }

    #[test]
    fn test_adapter_rule() {
        let mut mgr = NozzleResourceManager::new();
        let loose = mgr.register_pool("loose", vec![rack(1, false)]);
        let mounted = mgr.register_pool("mounted", vec![rack(2, true)]);
        assert!(mgr.activate(NozzleStyle::FullPlate, a(1), loose).is_err());
        assert!(mgr.activate(NozzleStyle::ColumnPartial, a(1), mounted).is_err());
    }

    #[test]
    fn test_bad_start_channel() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("aliquot", vec![rack(1, false)]);
        assert!(mgr.activate(NozzleStyle::ColumnPartial, a(6), pool).is_err());
    }

    #[test]
    fn test_pick_up_requires_layout_and_free_head() {
        let mut mgr = NozzleResourceManager::new();
        assert!(matches!(mgr.pick_up(), Err(AssayError::NoActiveConfiguration)));

        let pool = mgr.register_pool("aliquot", vec![rack(1, false)]);
        mgr.activate(NozzleStyle::ColumnPartial, a(1), pool).unwrap();
        let _tip = mgr.pick_up().unwrap();
        assert!(matches!(mgr.pick_up(), Err(AssayError::TipAlreadyAttached)));
    }

    #[test]
    fn test_second_rack_used_when_first_empty() {
        let mut mgr = NozzleResourceManager::new();
        let pool = mgr.register_pool("aliquot", vec![rack(1, false), rack(2, false)]);
        mgr.activate(NozzleStyle::ColumnPartial, a(1), pool).unwrap();
        for _ in 0..12 {
            let tip = mgr.pick_up().unwrap();
            mgr.release(tip, ReleaseTarget::Trash).unwrap();
        }
        let tip = mgr.pick_up().unwrap();
        assert_eq!(tip.rack(), LabwareHandle(2));
    }
}

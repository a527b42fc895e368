//! Strongly-typed assay configuration.
//!
//! Every tuning value the sequencer uses lives here: deck layout, tip
//! pools, reagent wells, heights and rates, aliquot recipes and the wash
//! loops. `AssayConfig::default()` is the LEGENDplex Human CD8/NK panel on
//! a Flex with the 96-channel head.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AssayError, AssayResult};
use crate::labware::{PlateFormat, WellName};
use crate::transfer::{MixSpec, TouchTip};
use crate::wash::WashLoopPlan;

/// Config file picked up by [`AssayConfig::load`] when present.
pub const DEFAULT_CONFIG_PATH: &str = "config/legendplex_cd8_nk.toml";

/// Top-level assay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssayConfig {
    /// Name and log level
    pub application: ApplicationConfig,
    /// Heights, rates and motion
    pub pipetting: PipettingConfig,
    /// Labware and tip racks
    pub deck: DeckConfig,
    /// Reservoir wells
    pub reagents: ReagentWells,
    /// Per-step aliquot recipes
    pub aliquots: AliquotConfig,
    /// Prewet and wash loops
    pub wash: WashConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Protocol name shown in logs and reports
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Heights, rates and motion shared by every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipettingConfig {
    /// Dispense height above the well bottom for reagent aliquots
    pub sample_height_mm: f64,
    /// Dispense height above the well bottom for wash buffer
    pub wash_height_mm: f64,
    /// Wash dispense rate, as a multiple of the default flow rate
    pub wash_rate: f64,
    /// Aspirate rate for the 96 to 384 distribution
    pub sample_rate: f64,
    /// Aspirate rate for viscous reagents from the small reservoir
    pub reagent_aspirate_rate: f64,
    /// Touch-tip after each aliquot dispense
    pub touch_tip: TouchTip,
    /// Pause after each reagent aspirate
    pub settle_secs: f64,
    /// Pause after the bubble check, before the sample distribution
    pub bubble_settle_secs: f64,
    /// Ask the operator to inspect the tips before distributing samples
    #[serde(default = "default_true")]
    pub bubble_check: bool,
}

impl PipettingConfig {
    /// Settle delay after each aliquot aspirate.
    pub fn settle(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_secs).unwrap_or_default()
    }

    /// Delay after the bubble check, before dispensing.
    pub fn bubble_settle(&self) -> Duration {
        Duration::try_from_secs_f64(self.bubble_settle_secs).unwrap_or_default()
    }
}

/// A piece of labware and where it sits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabwareSlot {
    /// Labware definition name (e.g. "agilent_384_wellplate_140ul")
    pub kind: String,
    /// Deck slot (e.g. "D1")
    pub slot: String,
    /// Name shown in logs and reports
    pub label: String,
}

/// Named group of tip racks drawn from by one pipetting layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipPoolConfig {
    /// Referenced by recipes and `wash.pool`
    pub name: String,
    /// Tip-rack definition name
    pub kind: String,
    /// One rack per slot
    pub slots: Vec<String>,
    /// Tip capacity
    pub tip_volume_ul: f64,
    /// Adapter the racks sit on; required for full-plate pick-up
    #[serde(default)]
    pub adapter: Option<String>,
}

/// Deck layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckConfig {
    /// 96-well sample plate
    pub source_plate: LabwareSlot,
    /// 384-well filter plate
    pub destination_plate: LabwareSlot,
    /// 12-well reservoir with matrix, buffers and antibodies
    pub reagent_reservoir: LabwareSlot,
    /// 1-well wash buffer reservoir
    pub wash_reservoir: LabwareSlot,
    /// Deck slot of the trash bin
    pub trash_slot: String,
    /// Tip pools, one per layout
    pub tip_pools: Vec<TipPoolConfig>,
}

impl DeckConfig {
    /// Pool by name.
    pub fn tip_pool(&self, name: &str) -> Option<&TipPoolConfig> {
        self.tip_pools.iter().find(|p| p.name == name)
    }
}

/// Reservoir wells holding each reagent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReagentWells {
    /// Well of the wash reservoir
    pub wash_buffer: WellName,
    /// Wells of the reagent reservoir
    pub standard_matrix: WellName,
    /// Assay buffer for the sample groups
    pub sample_buffer: WellName,
    /// Vortexed beads
    pub beads: WellName,
    /// Biotinylated detection antibody
    pub detection_antibody: WellName,
    /// Streptavidin-PE
    pub streptavidin_pe: WellName,
    /// Origin well on the source plate for the full-plate distribution
    pub source_sample: WellName,
}

/// One tip-load per quadrant group: aspirate, settle, four dispenses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliquotRecipe {
    /// Tip pool to draw from
    pub pool: String,
    /// Start channel of the nozzle layout
    pub start: WellName,
    /// Aspirated once per tip-load
    pub aspirate_ul: f64,
    /// Dispensed into each of the four anchors
    pub per_well_ul: f64,
    /// Multiple of the default flow rate
    pub dispense_rate: f64,
    /// Mixed in the source right before aspirating
    #[serde(default)]
    pub mix: Option<MixSpec>,
}

/// One recipe per aliquot step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliquotConfig {
    /// Matrix into the standards group
    pub standards: AliquotRecipe,
    /// Assay buffer into the sample groups
    pub samples: AliquotRecipe,
    /// Full-plate transfer from the source plate
    pub distribution: AliquotRecipe,
    /// Beads into every group
    pub beads: AliquotRecipe,
    /// Detection antibody into every group
    pub detection: AliquotRecipe,
    /// Streptavidin-PE into every group
    pub streptavidin: AliquotRecipe,
}

/// Plate prewet at the start of the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrewetConfig {
    /// Aspirated and blown out to rinse the tips
    pub preclean_ul: f64,
    /// Fill before priming
    pub aspirate_ul: f64,
    /// Dispensed back into the reservoir
    pub priming_ul: f64,
    /// Into each anchor
    pub per_well_ul: f64,
}

/// Full-plate wash settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WashConfig {
    /// Tip pool for the full-plate wash tips
    pub pool: String,
    /// Plate prewet at the start of the run
    pub prewet: PrewetConfig,
    /// Wash before the detection antibody
    pub wash_loop: WashLoopPlan,
    /// Wash and resuspend at the end of the run
    pub final_loop: WashLoopPlan,
}

fn default_true() -> bool {
    true
}

fn slot(kind: &str, slot: &str, label: &str) -> LabwareSlot {
    LabwareSlot {
        kind: kind.into(),
        slot: slot.into(),
        label: label.into(),
    }
}

fn pool(name: &str, kind: &str, slot: &str, tip_volume_ul: f64, on_adapter: bool) -> TipPoolConfig {
    TipPoolConfig {
        name: name.into(),
        kind: kind.into(),
        slots: vec![slot.into()],
        tip_volume_ul,
        adapter: on_adapter.then(|| "opentrons_flex_96_tiprack_adapter".to_string()),
    }
}

fn recipe(pool: &str, start: WellName, aspirate_ul: f64, rate: f64) -> AliquotRecipe {
    AliquotRecipe {
        pool: pool.into(),
        start,
        aspirate_ul,
        per_well_ul: 7.0,
        dispense_rate: rate,
        mix: None,
    }
}

impl Default for AssayConfig {
    fn default() -> Self {
        let a1 = WellName::from_indices(0, 1);
        let a12 = WellName::from_indices(0, 12);
        let well = |column| WellName::from_indices(0, column);
        const TIPS_50: &str = "opentrons_flex_96_filtertiprack_50ul";
        const TIPS_200: &str = "opentrons_flex_96_filtertiprack_200ul";

        Self {
            application: ApplicationConfig {
                name: "LEGENDplex Human CD8/NK".into(),
                log_level: "info".into(),
            },
            pipetting: PipettingConfig {
                sample_height_mm: 1.2,
                wash_height_mm: 14.0,
                wash_rate: 3.0,
                sample_rate: 1.0,
                reagent_aspirate_rate: 0.5,
                touch_tip: TouchTip {
                    v_offset_mm: -9.5,
                    speed_mm_s: 30.0,
                    radius: 0.85,
                },
                settle_secs: 1.0,
                bubble_settle_secs: 5.0,
                bubble_check: true,
            },
            deck: DeckConfig {
                source_plate: slot("corning_96_wellplate_360ul_flat", "B2", "Source Plate"),
                destination_plate: slot("agilent_384_wellplate_140ul", "D1", "Destination Plate"),
                reagent_reservoir: slot("nest_12_reservoir_15ml", "A1", "Small Reservoir"),
                wash_reservoir: slot("nest_1_reservoir_195ml", "D2", "Wash Buffer Reservoir"),
                trash_slot: "A3".into(),
                tip_pools: vec![
                    pool("aliquot", TIPS_50, "B1", 50.0, false),
                    pool("beads", TIPS_50, "C1", 50.0, false),
                    pool("detection", TIPS_50, "B3", 50.0, false),
                    pool("streptavidin", TIPS_50, "C3", 50.0, false),
                    pool("bulk", TIPS_50, "A2", 50.0, true),
                    pool("wash", TIPS_200, "D3", 200.0, true),
                ],
            },
            reagents: ReagentWells {
                wash_buffer: a1,
                standard_matrix: well(1),
                sample_buffer: well(2),
                beads: well(3),
                detection_antibody: well(4),
                streptavidin_pe: well(5),
                source_sample: a1,
            },
            aliquots: AliquotConfig {
                standards: recipe("aliquot", a1, 35.0, 1.0),
                samples: recipe("aliquot", a1, 50.0, 0.5),
                distribution: AliquotRecipe {
                    mix: Some(MixSpec {
                        repeats: 5,
                        volume_ul: 25.0,
                    }),
                    ..recipe("bulk", a1, 45.0, 1.0)
                },
                beads: AliquotRecipe {
                    mix: Some(MixSpec {
                        repeats: 10,
                        volume_ul: 30.0,
                    }),
                    ..recipe("beads", a1, 30.0, 1.0)
                },
                detection: recipe("detection", a12, 30.0, 1.0),
                streptavidin: recipe("streptavidin", a12, 30.0, 1.0),
            },
            wash: WashConfig {
                pool: "wash".into(),
                prewet: PrewetConfig {
                    preclean_ul: 180.0,
                    aspirate_ul: 180.0,
                    priming_ul: 10.0,
                    per_well_ul: 40.0,
                },
                wash_loop: WashLoopPlan::standard(),
                final_loop: WashLoopPlan::with_resuspend(),
            },
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AssayConfig {
    /// Load defaults, then `config/legendplex_cd8_nk.toml` if it exists,
    /// then `FLEXASSAY_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> AssayResult<Self> {
        Self::extract(Self::figment(Some(Path::new(DEFAULT_CONFIG_PATH))))
    }

    /// Like [`load`](Self::load) but with an explicit file, which must exist.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AssayResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AssayError::Configuration(format!(
                "config file '{}' not found",
                path.display()
            )));
        }
        Self::extract(Self::figment(Some(path)))
    }

    /// The merged provider stack, without extraction.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AssayConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("FLEXASSAY_").split("__"))
    }

    fn extract(figment: Figment) -> AssayResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Heights, rates, settle times and volumes are positive
    /// - Touch-tip radius is in (0, 1]
    /// - Deck slots are unique and tip pools are non-empty
    /// - Recipes name an existing pool, and that pool's mount suits the layout
    /// - Reagent wells exist in their reservoirs
    /// - The stage 2 loop has no resuspend step and the final loop has one
    ///
    /// Volume arithmetic against tip sizes is checked when the sequencer is
    /// built.
    pub fn validate(&self) -> AssayResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let p = &self.pipetting;
        positive("pipetting.sample_height_mm", p.sample_height_mm)?;
        positive("pipetting.wash_height_mm", p.wash_height_mm)?;
        positive("pipetting.wash_rate", p.wash_rate)?;
        positive("pipetting.sample_rate", p.sample_rate)?;
        positive("pipetting.reagent_aspirate_rate", p.reagent_aspirate_rate)?;
        positive("pipetting.touch_tip.speed_mm_s", p.touch_tip.speed_mm_s)?;
        if !(p.touch_tip.radius > 0.0 && p.touch_tip.radius <= 1.0) {
            return Err(invalid(format!(
                "Invalid touch_tip.radius {}. Must be in (0, 1]",
                p.touch_tip.radius
            )));
        }
        non_negative("pipetting.settle_secs", p.settle_secs)?;
        non_negative("pipetting.bubble_settle_secs", p.bubble_settle_secs)?;

        self.validate_deck()?;
        self.validate_reagents()?;

        let a = &self.aliquots;
        for (name, recipe, full_plate) in [
            ("standards", &a.standards, false),
            ("samples", &a.samples, false),
            ("distribution", &a.distribution, true),
            ("beads", &a.beads, false),
            ("detection", &a.detection, false),
            ("streptavidin", &a.streptavidin, false),
        ] {
            self.validate_recipe(name, recipe, full_plate)?;
        }

        let wash_pool = self.deck.tip_pool(&self.wash.pool).ok_or_else(|| {
            invalid(format!("wash.pool '{}' is not a configured tip pool", self.wash.pool))
        })?;
        if wash_pool.adapter.is_none() {
            return Err(invalid(format!(
                "wash pool '{}' must sit on a 96-channel adapter",
                wash_pool.name
            )));
        }
        if self.wash.wash_loop.resuspend.is_some() {
            return Err(invalid(
                "wash.wash_loop must not end on a resuspend step; every wash is vacuumed".into(),
            ));
        }
        if self.wash.final_loop.resuspend.is_none() {
            return Err(invalid(
                "wash.final_loop must end on a resuspend step; the plate is not vacuumed after it"
                    .into(),
            ));
        }

        let w = &self.wash.prewet;
        positive("wash.prewet.aspirate_ul", w.aspirate_ul)?;
        positive("wash.prewet.per_well_ul", w.per_well_ul)?;
        non_negative("wash.prewet.preclean_ul", w.preclean_ul)?;
        non_negative("wash.prewet.priming_ul", w.priming_ul)?;

        Ok(())
    }

    fn validate_deck(&self) -> AssayResult<()> {
        let d = &self.deck;
        let mut slots = HashSet::new();
        let fixed = [
            &d.source_plate.slot,
            &d.destination_plate.slot,
            &d.reagent_reservoir.slot,
            &d.wash_reservoir.slot,
            &d.trash_slot,
        ];
        let racks = d.tip_pools.iter().flat_map(|p| p.slots.iter());
        for slot in fixed.into_iter().chain(racks) {
            if !slots.insert(slot.as_str()) {
                return Err(invalid(format!("Duplicate deck slot: '{slot}'")));
            }
        }

        let mut names = HashSet::new();
        for pool in &d.tip_pools {
            if !names.insert(pool.name.as_str()) {
                return Err(invalid(format!("Duplicate tip pool: '{}'", pool.name)));
            }
            if pool.slots.is_empty() {
                return Err(invalid(format!("Tip pool '{}' has no racks", pool.name)));
            }
            positive(&format!("tip pool '{}' tip_volume_ul", pool.name), pool.tip_volume_ul)?;
        }
        Ok(())
    }

    fn validate_reagents(&self) -> AssayResult<()> {
        let r = &self.reagents;
        let checks = [
            ("wash_buffer", r.wash_buffer, PlateFormat::RESERVOIR_1),
            ("standard_matrix", r.standard_matrix, PlateFormat::RESERVOIR_12),
            ("sample_buffer", r.sample_buffer, PlateFormat::RESERVOIR_12),
            ("beads", r.beads, PlateFormat::RESERVOIR_12),
            ("detection_antibody", r.detection_antibody, PlateFormat::RESERVOIR_12),
            ("streptavidin_pe", r.streptavidin_pe, PlateFormat::RESERVOIR_12),
            ("source_sample", r.source_sample, PlateFormat::WELLS_96),
        ];
        for (name, well, format) in checks {
            if !format.contains(well) {
                return Err(invalid(format!(
                    "reagents.{name}: well {well} does not exist in a {}x{} labware",
                    format.rows, format.columns
                )));
            }
        }
        Ok(())
    }

    fn validate_recipe(&self, name: &str, recipe: &AliquotRecipe, full_plate: bool) -> AssayResult<()> {
        let pool = self.deck.tip_pool(&recipe.pool).ok_or_else(|| {
            invalid(format!(
                "aliquots.{name}: pool '{}' is not a configured tip pool",
                recipe.pool
            ))
        })?;
        match (full_plate, pool.adapter.is_some()) {
            (true, false) => {
                return Err(invalid(format!(
                    "aliquots.{name}: full-plate pool '{}' must sit on an adapter",
                    pool.name
                )))
            }
            (false, true) => {
                return Err(invalid(format!(
                    "aliquots.{name}: column pool '{}' must not sit on an adapter",
                    pool.name
                )))
            }
            _ => {}
        }
        let start_ok = recipe.start.row_index() == 0
            && (recipe.start.column() == 1 || (!full_plate && recipe.start.column() == 12));
        if !start_ok {
            return Err(invalid(format!(
                "aliquots.{name}: start channel {} is not usable",
                recipe.start
            )));
        }
        positive(&format!("aliquots.{name}.aspirate_ul"), recipe.aspirate_ul)?;
        positive(&format!("aliquots.{name}.per_well_ul"), recipe.per_well_ul)?;
        positive(&format!("aliquots.{name}.dispense_rate"), recipe.dispense_rate)?;
        Ok(())
    }
}

fn invalid(message: String) -> AssayError {
    AssayError::Configuration(message)
}

fn positive(what: &str, value: f64) -> AssayResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("Invalid {what} {value}. Must be > 0")))
    }
}

fn non_negative(what: &str, value: f64) -> AssayResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("Invalid {what} {value}. Must be >= 0")))
    }
}

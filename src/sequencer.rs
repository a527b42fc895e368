//! Stage sequencer.
//!
//! [`StageSequencer`] owns the pipette, the checkpoint gate and the run
//! state. Each [`advance`](StageSequencer::advance) runs exactly one stage:
//! it picks a nozzle layout, takes well groups from the quadrant mapper,
//! issues transfers and opens checkpoints between sub-steps. A failure at
//! any point halts the run where it is; nothing is rolled back.
//!
//! All volume arithmetic is checked in [`StageSequencer::new`] by building
//! the same transfer plans the stages execute, so a bad configuration is
//! rejected before the first hardware call.

use tracing::{debug, error, info, info_span, Instrument};

use crate::checkpoint::{Checkpoint, CheckpointGate, CheckpointKind, GateRecord, Operator};
use crate::config::{AliquotRecipe, AssayConfig, PipettingConfig};
use crate::driver::LiquidHandler;
use crate::error::{AssayError, AssayResult};
use crate::labware::{
    LabwareHandle, LabwareRole, LabwareSpec, Location, PlateFormat, Reagent, Well, WellName,
    WellPosition,
};
use crate::nozzle::{NozzleStyle, TipRack};
use crate::quadrant::{WellGroup, WellQuadrantMapper};
use crate::report::{RunReport, RunTally};
use crate::stage::{AssayStage, RunState};
use crate::transfer::{DispenseStep, Pipette, TransferPlan};
use crate::wash::{IterationKind, WashLoopPlan};

const A1: WellName = WellName::from_indices(0, 1);

/// Handles of the loaded labware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deck {
    /// 96-well sample plate.
    pub source_plate: LabwareHandle,
    /// 384-well filter plate.
    pub destination_plate: LabwareHandle,
    /// 12-well reservoir.
    pub reagent_reservoir: LabwareHandle,
    /// Single-well wash reservoir.
    pub wash_reservoir: LabwareHandle,
    /// Trash bin.
    pub trash: LabwareHandle,
}

impl Deck {
    /// Stand-in used to build plans for static checks.
    fn placeholder() -> Self {
        let h = LabwareHandle(0);
        Self {
            source_plate: h,
            destination_plate: h,
            reagent_reservoir: h,
            wash_reservoir: h,
            trash: h,
        }
    }
}

/// One tip-load into the four anchors of `group`.
fn aliquot_plan(
    pipetting: &PipettingConfig,
    destination: LabwareHandle,
    recipe: &AliquotRecipe,
    source: WellPosition,
    aspirate_rate: f64,
    group: &WellGroup,
) -> TransferPlan {
    let mut plan = TransferPlan::new(source, recipe.aspirate_ul)
        .aspirate_rate(aspirate_rate)
        .settle(pipetting.settle());
    if let Some(mix) = recipe.mix {
        plan = plan.mix(mix);
    }
    group.wells().iter().fold(plan, |plan, well| {
        plan.dispense(DispenseStep {
            volume_ul: recipe.per_well_ul,
            at: Well::new(destination, *well).bottom(pipetting.sample_height_mm),
            rate: recipe.dispense_rate,
            touch_tip: Some(pipetting.touch_tip),
        })
    })
}

/// Prewet: fill, prime back into the reservoir, 4 wash dispenses, blow out.
fn prewet_plan(config: &AssayConfig, deck: &Deck, group: &WellGroup) -> TransferPlan {
    let p = &config.pipetting;
    let w = &config.wash.prewet;
    let reservoir = Well::new(deck.wash_reservoir, config.reagents.wash_buffer).default_position();
    let mut plan = TransferPlan::new(reservoir, w.aspirate_ul);
    if w.priming_ul > 0.0 {
        plan = plan.pre_dispense(w.priming_ul, reservoir);
    }
    group
        .wells()
        .iter()
        .fold(plan, |plan, well| {
            plan.dispense(DispenseStep {
                volume_ul: w.per_well_ul,
                at: Well::new(deck.destination_plate, *well).bottom(p.wash_height_mm),
                rate: p.wash_rate,
                touch_tip: None,
            })
        })
        .blow_out(Location::Trash(deck.trash))
}

fn tip_volume(config: &AssayConfig, pool: &str) -> AssayResult<f64> {
    config
        .deck
        .tip_pool(pool)
        .map(|p| p.tip_volume_ul)
        .ok_or_else(|| AssayError::Configuration(format!("unknown tip pool '{pool}'")))
}

/// Static volume checks for every plan and loop the run will execute.
fn check_volumes(config: &AssayConfig) -> AssayResult<()> {
    let deck = Deck::placeholder();
    let mapper = WellQuadrantMapper::new();
    let group = mapper.standards_group();
    let source = Well::new(deck.reagent_reservoir, A1).default_position();

    let wash_tip = tip_volume(config, &config.wash.pool)?;
    TransferPlan::new(source, config.wash.prewet.preclean_ul).validate(wash_tip)?;
    prewet_plan(config, &deck, &group).validate(wash_tip)?;
    config.wash.wash_loop.validate(wash_tip)?;
    config.wash.final_loop.validate(wash_tip)?;

    let a = &config.aliquots;
    for recipe in [
        &a.standards,
        &a.samples,
        &a.distribution,
        &a.beads,
        &a.detection,
        &a.streptavidin,
    ] {
        let tip = tip_volume(config, &recipe.pool)?;
        aliquot_plan(&config.pipetting, deck.destination_plate, recipe, source, 1.0, &group)
            .validate(tip)
            .map_err(|e| match e {
                AssayError::VolumeInvariantViolation(msg) => {
                    AssayError::volume(format!("pool '{}': {msg}", recipe.pool))
                }
                other => other,
            })?;
    }
    Ok(())
}

/// Drives the assay through its four stages.
pub struct StageSequencer<D, O> {
    config: AssayConfig,
    pipette: Pipette<D>,
    gate: CheckpointGate<O>,
    mapper: WellQuadrantMapper,
    state: RunState,
    deck: Option<Deck>,
    tally: RunTally,
}

impl<D: LiquidHandler, O: Operator> StageSequencer<D, O> {
    /// Validate `config` (including all volume arithmetic) and set up a run.
    ///
    /// Nothing is sent to the driver until the first [`advance`](Self::advance).
    pub fn new(config: AssayConfig, driver: D, operator: O) -> AssayResult<Self> {
        config.validate()?;
        check_volumes(&config)?;
        Ok(Self {
            config,
            pipette: Pipette::new(driver),
            gate: CheckpointGate::new(operator),
            mapper: WellQuadrantMapper::new(),
            state: RunState::initial(),
            deck: None,
            tally: RunTally::new(),
        })
    }

    /// Where the run is.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Validated configuration the run uses.
    pub fn config(&self) -> &AssayConfig {
        &self.config
    }

    /// The underlying liquid handler.
    pub fn driver(&self) -> &D {
        self.pipette.driver()
    }

    /// Pipette state and counters.
    pub fn pipette(&self) -> &Pipette<D> {
        &self.pipette
    }

    /// The operator answering checkpoints.
    pub fn operator(&self) -> &O {
        self.gate.operator()
    }

    /// Answered gates so far.
    pub fn checkpoints(&self) -> &[GateRecord] {
        self.gate.history()
    }

    /// Notifications sent so far.
    pub fn notifications(&self) -> &[String] {
        self.gate.notes()
    }

    /// Handles of the loaded deck; `None` before the first stage.
    pub fn deck(&self) -> Option<&Deck> {
        self.deck.as_ref()
    }

    /// Snapshot of the run so far.
    pub fn report(&self) -> RunReport {
        RunReport::new(
            &self.config.application.name,
            &self.tally,
            &self.state,
            self.gate.history(),
            self.gate.notes(),
            self.pipette.stats(),
        )
    }

    /// Run every remaining stage.
    pub async fn run(&mut self) -> AssayResult<RunReport> {
        if let RunState::Halted { stage, reason } = &self.state {
            return Err(AssayError::StageOrder(format!(
                "run halted in {stage}: {reason}"
            )));
        }
        info!(
            run_id = %self.tally.run_id,
            protocol = %self.config.application.name,
            "Starting assay run"
        );
        while self.state.pending_stage().is_some() {
            self.advance().await?;
        }
        info!(run_id = %self.tally.run_id, "Assay run complete");
        Ok(self.report())
    }

    /// Run the pending stage and move to the next state.
    pub async fn advance(&mut self) -> AssayResult<RunState> {
        let stage = match &self.state {
            RunState::Stage { stage } => *stage,
            RunState::Done => return Err(AssayError::StageOrder("run already finished".into())),
            RunState::Halted { stage, reason } => {
                return Err(AssayError::StageOrder(format!(
                    "run halted in {stage}: {reason}"
                )))
            }
        };

        let span = info_span!("stage", step = stage.number(), name = %stage);
        let outcome: AssayResult<RunState> = async {
            info!("Stage starting");
            self.run_stage(stage).await?;
            let satisfied = !stage.has_terminal_gate() || self.gate.terminal_acknowledged(stage);
            self.state.after(stage, satisfied)
        }
        .instrument(span)
        .await;

        match outcome {
            Ok(next) => {
                info!(step = stage.number(), %stage, next = %next, "Stage complete");
                self.tally.stages_completed.push(stage);
                self.state = next;
                Ok(self.state.clone())
            }
            Err(e) => {
                error!(step = stage.number(), %stage, error = %e, "Run halted");
                self.state = RunState::Halted {
                    stage,
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    async fn run_stage(&mut self, stage: AssayStage) -> AssayResult<()> {
        if self.deck.is_none() {
            self.deck = Some(self.load_deck().await?);
        }
        match stage {
            AssayStage::PrewetAndAliquot => self.prewet_and_aliquot().await,
            AssayStage::WashAndDetectionAntibody => self.wash_and_detection().await,
            AssayStage::StreptavidinPe => self.streptavidin().await,
            AssayStage::FinalWashResuspend => self.final_wash().await,
        }
    }

    fn loaded_deck(&self) -> AssayResult<Deck> {
        self.deck
            .ok_or_else(|| AssayError::StageOrder("deck has not been loaded".into()))
    }

    async fn load_deck(&mut self) -> AssayResult<Deck> {
        let d = self.config.deck.clone();
        let spec = |slot: &crate::config::LabwareSlot, role, format| LabwareSpec {
            kind: slot.kind.clone(),
            slot: slot.slot.clone(),
            label: slot.label.clone(),
            role,
            format,
            adapter: None,
        };

        let driver = self.pipette.driver_mut();
        let deck = Deck {
            source_plate: driver
                .load_labware(&spec(&d.source_plate, LabwareRole::SourcePlate, PlateFormat::WELLS_96))
                .await?,
            destination_plate: driver
                .load_labware(&spec(
                    &d.destination_plate,
                    LabwareRole::DestinationPlate,
                    PlateFormat::WELLS_384,
                ))
                .await?,
            reagent_reservoir: driver
                .load_labware(&spec(
                    &d.reagent_reservoir,
                    LabwareRole::ReagentReservoir,
                    PlateFormat::RESERVOIR_12,
                ))
                .await?,
            wash_reservoir: driver
                .load_labware(&spec(
                    &d.wash_reservoir,
                    LabwareRole::WashReservoir,
                    PlateFormat::RESERVOIR_1,
                ))
                .await?,
            trash: driver.load_trash(&d.trash_slot).await?,
        };

        for pool in &d.tip_pools {
            let mut racks = Vec::with_capacity(pool.slots.len());
            for slot in &pool.slots {
                let label = format!("{} tips @ {slot}", pool.name);
                let labware = self
                    .pipette
                    .driver_mut()
                    .load_labware(&LabwareSpec {
                        kind: pool.kind.clone(),
                        slot: slot.clone(),
                        label: label.clone(),
                        role: LabwareRole::TipRack,
                        format: PlateFormat::TIP_RACK,
                        adapter: pool.adapter.clone(),
                    })
                    .await?;
                racks.push(TipRack {
                    labware,
                    label,
                    tip_volume_ul: pool.tip_volume_ul,
                    on_adapter: pool.adapter.is_some(),
                });
            }
            self.pipette.nozzles_mut().register_pool(pool.name.clone(), racks);
        }

        info!(
            pools = d.tip_pools.len(),
            "Deck loaded: source {}, destination {}, trash {}",
            d.source_plate.slot,
            d.destination_plate.slot,
            d.trash_slot
        );
        Ok(deck)
    }

    /// Switch the head layout unless it is already what is asked for.
    async fn use_layout(&mut self, style: NozzleStyle, start: WellName, pool: &str) -> AssayResult<()> {
        let nozzles = self.pipette.nozzles();
        let id = nozzles
            .pool_id(pool)
            .ok_or_else(|| AssayError::Configuration(format!("unknown tip pool '{pool}'")))?;
        if let Some(active) = nozzles.active() {
            if active.style == style && active.start == start && active.pool == id {
                return Ok(());
            }
        }
        debug!(%style, %start, pool, "Configuring nozzle layout");
        self.pipette.configure(style, start, id).await?;
        Ok(())
    }

    async fn pick_up(&mut self) -> AssayResult<()> {
        self.pipette.pick_up_tip().await?;
        if let Some(active) = self.pipette.nozzles().active() {
            let pool = self.pipette.nozzles().pool_name(active.pool).to_string();
            self.tally.tip_used(&pool);
        }
        Ok(())
    }

    fn reagent_well(&self, deck: &Deck, well: WellName) -> WellPosition {
        Well::new(deck.reagent_reservoir, well).default_position()
    }

    /// One column tip per group: aspirate, settle, 7 µL into each anchor.
    async fn aliquot(
        &mut self,
        reagent: Reagent,
        recipe: &AliquotRecipe,
        source: WellPosition,
        groups: &[WellGroup],
    ) -> AssayResult<()> {
        let deck = self.loaded_deck()?;
        self.use_layout(NozzleStyle::ColumnPartial, recipe.start, &recipe.pool)
            .await?;
        for group in groups {
            let plan = aliquot_plan(
                &self.config.pipetting,
                deck.destination_plate,
                recipe,
                source,
                self.config.pipetting.reagent_aspirate_rate,
                group,
            );
            debug!(%reagent, %group, "Aliquot");
            self.pick_up().await?;
            self.pipette.transfer(&plan).await?;
            self.tally.dispensed(reagent, plan.dispenses.len());
            self.pipette.drop_tip(deck.trash).await?;
        }
        Ok(())
    }

    /// Full-plate transfer from the source plate into group 0, with a
    /// bubble check between aspirate and dispense.
    async fn distribute(&mut self, stage: AssayStage, recipe: &AliquotRecipe) -> AssayResult<()> {
        let deck = self.loaded_deck()?;
        let p = self.config.pipetting.clone();
        let source = Well::new(deck.source_plate, self.config.reagents.source_sample).default_position();
        let plan = aliquot_plan(
            &p,
            deck.destination_plate,
            recipe,
            source,
            p.sample_rate,
            &self.mapper.standards_group(),
        );

        self.gate.notify("Starting 96 to 384 well distribution");
        self.use_layout(NozzleStyle::FullPlate, recipe.start, &recipe.pool)
            .await?;
        self.pick_up().await?;
        if let Some(mix) = &plan.mix {
            self.pipette.mix(mix, &plan.source).await?;
        }
        self.pipette
            .aspirate(plan.aspirate_ul, &plan.source, plan.aspirate_rate)
            .await?;
        if p.bubble_check {
            self.gate
                .wait(Checkpoint::new(
                    stage,
                    CheckpointKind::BubbleCheck,
                    "Check the tips for bubbles",
                ))
                .await?;
        }
        self.pipette.delay(p.bubble_settle()).await?;
        for step in &plan.dispenses {
            self.pipette.dispense(step.volume_ul, &step.at, step.rate).await?;
            if let Some(touch) = &step.touch_tip {
                self.pipette.touch_tip(touch).await?;
            }
        }
        self.tally.dispensed(Reagent::SourceSamples, plan.dispenses.len());
        self.pipette.drop_tip(deck.trash).await
    }

    /// Fill once, then prime + 4 dispenses per iteration, topping up between.
    async fn wash_loop(&mut self, stage: AssayStage, plan: &WashLoopPlan) -> AssayResult<()> {
        let deck = self.loaded_deck()?;
        let (height, rate) = (self.config.pipetting.wash_height_mm, self.config.pipetting.wash_rate);
        let reservoir = Well::new(deck.wash_reservoir, self.config.reagents.wash_buffer).default_position();
        let anchors: Vec<WellPosition> = self
            .mapper
            .standards_group()
            .wells()
            .iter()
            .map(|w| Well::new(deck.destination_plate, *w).bottom(height))
            .collect();

        self.pipette
            .aspirate(plan.initial_aspirate_ul, &reservoir, 1.0)
            .await?;
        for it in plan.schedule() {
            debug!(
                iteration = it.number,
                total = it.total,
                held_ul = self.pipette.held_ul(),
                "Wash iteration"
            );
            if it.priming_ul > 0.0 {
                self.pipette.dispense(it.priming_ul, &reservoir, 1.0).await?;
            }
            for at in &anchors {
                self.pipette.dispense(it.per_well_ul, at, rate).await?;
            }
            self.tally.dispensed(Reagent::WashBuffer, anchors.len());
            if let Some(refill) = it.refill_after_ul {
                self.pipette.aspirate(refill, &reservoir, 1.0).await?;
            }
            match it.kind {
                IterationKind::Wash => {
                    self.gate
                        .wait(
                            Checkpoint::new(
                                stage,
                                CheckpointKind::WashVacuum,
                                format!(
                                    "Dispense {}/{} complete. Vacuum and place back the filter plate.",
                                    it.number, it.total
                                ),
                            )
                            .with_progress(it.number, it.total),
                        )
                        .await?
                }
                IterationKind::Resuspend => self.gate.notify(format!(
                    "Dispense {}/{} is the final fill. Do not vacuum; the plate is ready to read.",
                    it.number, it.total
                )),
            }
        }
        Ok(())
    }

    /// Wash tips on, fresh rack, run `plan`, blow out and return the tips.
    async fn full_plate_wash(&mut self, stage: AssayStage, plan: &WashLoopPlan) -> AssayResult<()> {
        let deck = self.loaded_deck()?;
        let pool = self.config.wash.pool.clone();
        self.use_layout(NozzleStyle::FullPlate, A1, &pool).await?;
        self.pipette.reset_tips().await?;
        self.pick_up().await?;
        self.wash_loop(stage, plan).await?;
        self.pipette.blow_out(&Location::Trash(deck.trash)).await?;
        self.pipette.return_tip().await
    }

    async fn prewet_and_aliquot(&mut self) -> AssayResult<()> {
        let stage = AssayStage::PrewetAndAliquot;
        let deck = self.loaded_deck()?;
        self.gate.notify(
            "Step 1: prewet the plate, then aliquot matrix, assay buffer, samples and beads",
        );

        // prewet
        let pool = self.config.wash.pool.clone();
        let preclean_ul = self.config.wash.prewet.preclean_ul;
        let plan = prewet_plan(&self.config, &deck, &self.mapper.standards_group());
        self.use_layout(NozzleStyle::FullPlate, A1, &pool).await?;
        self.pick_up().await?;
        if preclean_ul > 0.0 {
            self.pipette.aspirate(preclean_ul, &plan.source, 1.0).await?;
            self.gate.notify("Cleaning tips");
            self.pipette.blow_out(&Location::Trash(deck.trash)).await?;
        }
        self.pipette.transfer(&plan).await?;
        self.tally.dispensed(Reagent::WashBuffer, plan.dispenses.len());
        self.pipette.return_tip().await?;
        self.gate
            .wait(Checkpoint::new(
                stage,
                CheckpointKind::PlateVacuum,
                "Plate is wetted. Wait at least 1 minute, vacuum, and return the plate.",
            ))
            .await?;

        let aliquots = self.config.aliquots.clone();
        let reagents = self.config.reagents.clone();

        let source = self.reagent_well(&deck, reagents.standard_matrix);
        self.aliquot(
            Reagent::StandardMatrix,
            &aliquots.standards,
            source,
            &[self.mapper.standards_group()],
        )
        .await?;
        self.gate.notify(format!(
            "Standard wells now hold {} µL of matrix",
            aliquots.standards.per_well_ul
        ));

        let source = self.reagent_well(&deck, reagents.sample_buffer);
        self.aliquot(
            Reagent::SampleBuffer,
            &aliquots.samples,
            source,
            &self.mapper.sample_groups(),
        )
        .await?;
        self.gate.notify(format!(
            "Sample wells now hold {} µL of assay buffer",
            aliquots.samples.per_well_ul
        ));

        self.distribute(stage, &aliquots.distribution).await?;
        self.gate.notify("Distribution complete, beads next");

        let bulk_slots = self
            .config
            .deck
            .tip_pool(&aliquots.distribution.pool)
            .map(|p| p.slots.join(", "))
            .unwrap_or_default();
        self.gate
            .wait(Checkpoint::new(
                stage,
                CheckpointKind::BeadLoading,
                format!(
                    "Remove the tip rack from {bulk_slots} and load vortexed beads into reservoir well {}",
                    reagents.beads
                ),
            ))
            .await?;

        let source = self.reagent_well(&deck, reagents.beads);
        self.aliquot(Reagent::Beads, &aliquots.beads, source, &self.mapper.all_groups())
            .await?;

        self.gate
            .wait(
                Checkpoint::new(
                    stage,
                    CheckpointKind::Incubation,
                    "All wells have beads. Seal and incubate 2 hours shaking at 1200 rpm.",
                )
                .terminal(),
            )
            .await
    }

    async fn wash_and_detection(&mut self) -> AssayResult<()> {
        let stage = AssayStage::WashAndDetectionAntibody;
        let deck = self.loaded_deck()?;
        let plan = self.config.wash.wash_loop.clone();
        self.gate.notify(format!(
            "Step 2: wash the plate {}x by vacuum, then add detection antibody",
            plan.iterations
        ));
        self.full_plate_wash(stage, &plan).await?;

        let recipe = self.config.aliquots.detection.clone();
        let source = self.reagent_well(&deck, self.config.reagents.detection_antibody);
        self.gate.notify(format!(
            "Dispensing detection antibody from reservoir well {}",
            self.config.reagents.detection_antibody
        ));
        self.aliquot(
            Reagent::DetectionAntibody,
            &recipe,
            source,
            &self.mapper.all_groups(),
        )
        .await?;

        self.gate
            .wait(
                Checkpoint::new(
                    stage,
                    CheckpointKind::Incubation,
                    format!(
                        "All wells now hold {} µL of detection antibody. Incubate 60 minutes.",
                        recipe.per_well_ul
                    ),
                )
                .terminal(),
            )
            .await
    }

    async fn streptavidin(&mut self) -> AssayResult<()> {
        let stage = AssayStage::StreptavidinPe;
        let deck = self.loaded_deck()?;
        self.gate.notify("Step 3: add streptavidin-PE");

        let recipe = self.config.aliquots.streptavidin.clone();
        let source = self.reagent_well(&deck, self.config.reagents.streptavidin_pe);
        self.aliquot(
            Reagent::StreptavidinPe,
            &recipe,
            source,
            &self.mapper.all_groups(),
        )
        .await?;

        self.gate
            .wait(
                Checkpoint::new(
                    stage,
                    CheckpointKind::PreWashVacuum,
                    format!(
                        "All wells now hold {} µL of streptavidin-PE. Vacuum, then continue to the final wash.",
                        recipe.per_well_ul
                    ),
                )
                .terminal(),
            )
            .await
    }

    async fn final_wash(&mut self) -> AssayResult<()> {
        let stage = AssayStage::FinalWashResuspend;
        let plan = self.config.wash.final_loop.clone();
        self.gate.notify("Step 4: final wash and resuspend");
        self.full_plate_wash(stage, &plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::AutoAcknowledge;
    use crate::driver::{DriverCommand, SimulatedFlex};
    use crate::wash::ResuspendStep;
    use tracing_test::traced_test;

    fn sequencer(config: AssayConfig) -> AssayResult<StageSequencer<SimulatedFlex, AutoAcknowledge>> {
        StageSequencer::new(config, SimulatedFlex::new(), AutoAcknowledge::new())
    }

    #[test]
    fn test_new_rejects_unbalanced_wash_loop() {
        let mut config = AssayConfig::default();
        config.wash.wash_loop.replenish_ul = 120.0;
        let err = sequencer(config).err().unwrap();
        assert!(matches!(err, AssayError::VolumeInvariantViolation(_)));
    }

    #[test]
    fn test_new_rejects_oversized_aliquot() {
        let mut config = AssayConfig::default();
        config.aliquots.samples.aspirate_ul = 60.0;
        let err = sequencer(config).err().unwrap();
        assert!(err.to_string().contains("pool 'aliquot'"));

        let mut config = AssayConfig::default();
        config.aliquots.beads.per_well_ul = 8.0;
        assert!(sequencer(config).is_err());
    }

    #[test]
    fn test_new_rejects_bad_resuspend_fill() {
        let mut config = AssayConfig::default();
        config.wash.final_loop.resuspend = Some(ResuspendStep {
            aspirate_ul: 60.0,
            per_well_ul: 20.0,
        });
        assert!(sequencer(config).is_err());
    }

    #[tokio::test]
    async fn test_first_advance_loads_deck_and_runs_stage_one() {
        let mut seq = sequencer(AssayConfig::default()).unwrap();
        assert!(seq.driver().commands().is_empty());

        let next = seq.advance().await.unwrap();
        assert_eq!(
            next,
            RunState::Stage {
                stage: AssayStage::WashAndDetectionAntibody
            }
        );
        let deck = *seq.deck().unwrap();
        assert_eq!(seq.driver().handle_for("Destination Plate"), Some(deck.destination_plate));
        assert_eq!(seq.driver().handle_for("trash"), Some(deck.trash));

        let kinds: Vec<_> = seq.checkpoints().iter().map(|r| r.checkpoint.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                CheckpointKind::PlateVacuum,
                CheckpointKind::BubbleCheck,
                CheckpointKind::BeadLoading,
                CheckpointKind::Incubation,
            ]
        );
        assert!(seq.checkpoints().last().unwrap().checkpoint.is_terminal());
    }

    #[tokio::test]
    async fn test_bubble_check_can_be_disabled() {
        let mut config = AssayConfig::default();
        config.pipetting.bubble_check = false;
        let mut seq = sequencer(config).unwrap();
        seq.advance().await.unwrap();
        assert!(seq
            .checkpoints()
            .iter()
            .all(|r| r.checkpoint.kind() != CheckpointKind::BubbleCheck));
        assert!(seq
            .driver()
            .commands()
            .contains(&DriverCommand::Delay(std::time::Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn test_prewet_precleans_then_primes() {
        let mut seq = sequencer(AssayConfig::default()).unwrap();
        seq.advance().await.unwrap();
        let deck = *seq.deck().unwrap();
        let cmds = seq.driver().commands();
        let first_pickup = cmds
            .iter()
            .position(|c| matches!(c, DriverCommand::PickUpTip { .. }))
            .unwrap();
        assert!(matches!(
            cmds[first_pickup + 1],
            DriverCommand::Aspirate { volume_ul, .. } if volume_ul == 180.0
        ));
        assert!(matches!(cmds[first_pickup + 2], DriverCommand::BlowOut { into_trash: true }));
        assert!(matches!(
            &cmds[first_pickup + 4],
            DriverCommand::Dispense { volume_ul, labware, .. }
                if *volume_ul == 10.0 && *labware == deck.wash_reservoir
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fault_logs_halt() {
        let driver = SimulatedFlex::new().with_fault_at(3);
        let mut seq = StageSequencer::new(AssayConfig::default(), driver, AutoAcknowledge::new())
            .unwrap();
        assert!(seq.advance().await.is_err());
        assert!(seq.state().is_halted());
        assert!(seq.deck().is_none());
        assert!(logs_contain("Run halted"));
    }

    #[tokio::test]
    async fn test_advance_after_done_is_refused() {
        let mut seq = sequencer(AssayConfig::default()).unwrap();
        seq.run().await.unwrap();
        assert!(seq.state().is_done());
        assert!(matches!(
            seq.advance().await,
            Err(AssayError::StageOrder(_))
        ));
    }
}

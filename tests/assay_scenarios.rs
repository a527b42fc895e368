//! End-to-end runs of the assay on the simulated deck.

use std::collections::BTreeSet;

use flex_assay::checkpoint::{
    Acknowledgement, AutoAcknowledge, ChannelOperator, CheckpointKind, OperatorEvent,
};
use flex_assay::config::AssayConfig;
use flex_assay::driver::{DriverCommand, SimulatedFlex};
use flex_assay::labware::{LabwareHandle, Reagent, WellName};
use flex_assay::quadrant::WellQuadrantMapper;
use flex_assay::{AssayError, AssayStage, RunState, StageSequencer};

type Sequencer = StageSequencer<SimulatedFlex, AutoAcknowledge>;

fn sequencer() -> Sequencer {
    StageSequencer::new(AssayConfig::default(), SimulatedFlex::new(), AutoAcknowledge::new())
        .unwrap()
}

fn aspirate_volumes(commands: &[DriverCommand]) -> Vec<f64> {
    commands
        .iter()
        .filter_map(|c| match c {
            DriverCommand::Aspirate { volume_ul, .. } => Some(*volume_ul),
            _ => None,
        })
        .collect()
}

fn dispenses_into(commands: &[DriverCommand], target: LabwareHandle) -> Vec<(WellName, f64)> {
    commands
        .iter()
        .filter_map(|c| match c {
            DriverCommand::Dispense {
                labware,
                well,
                volume_ul,
                ..
            } if *labware == target => Some((*well, *volume_ul)),
            _ => None,
        })
        .collect()
}

/// Commands from the first pick-up up to and including the first return.
fn wash_segment(commands: &[DriverCommand]) -> &[DriverCommand] {
    let start = commands
        .iter()
        .position(|c| matches!(c, DriverCommand::PickUpTip { .. }))
        .unwrap();
    let end = commands
        .iter()
        .position(|c| matches!(c, DriverCommand::ReturnTip))
        .unwrap();
    &commands[start..=end]
}

#[tokio::test]
async fn scenario_a_aliquot_pool_serves_all_groups_from_one_rack() {
    let mut seq = sequencer();
    seq.advance().await.unwrap();

    let rack = seq.driver().handle_for("aliquot tips @ B1").unwrap();
    let destination = seq.deck().unwrap().destination_plate;

    let mut current_rack = None;
    let mut columns = Vec::new();
    let mut wells = BTreeSet::new();
    let mut aliquot_dispenses = 0;
    for command in seq.driver().commands() {
        match command {
            DriverCommand::PickUpTip { rack: r, columns: c } => {
                current_rack = Some(*r);
                if *r == rack {
                    columns.extend(c.iter().copied());
                }
            }
            DriverCommand::Dispense {
                labware,
                well,
                volume_ul,
                ..
            } if current_rack == Some(rack) && *labware == destination => {
                assert_eq!(*volume_ul, 7.0);
                wells.insert(*well);
                aliquot_dispenses += 1;
            }
            _ => {}
        }
    }

    // start channel A1 works from the right-hand column leftwards
    assert_eq!(columns, (1..=12).rev().collect::<Vec<u8>>());
    assert_eq!(aliquot_dispenses, 48);

    let anchors: BTreeSet<WellName> = WellQuadrantMapper::new()
        .all_groups()
        .iter()
        .flat_map(|g| g.wells().iter().copied())
        .collect();
    assert_eq!(wells, anchors);

    let report = seq.report();
    assert_eq!(report.dispenses_of(Reagent::StandardMatrix), 4);
    assert_eq!(report.dispenses_of(Reagent::SampleBuffer), 44);
    assert_eq!(report.tips_from("aliquot"), 12);

    let pool = seq.pipette().nozzles().pool_id("aliquot").unwrap();
    assert_eq!(seq.pipette().nozzles().remaining_tips(pool), 0);
}

#[tokio::test]
async fn scenario_b_wash_loop_balances_and_skips_last_refill() {
    let mut seq = sequencer();
    seq.advance().await.unwrap();
    let before = seq.driver().commands().len();
    seq.advance().await.unwrap();

    let deck = *seq.deck().unwrap();
    let stage_two = &seq.driver().commands()[before..];
    let wash = wash_segment(stage_two);

    assert_eq!(aspirate_volumes(wash), vec![180.0, 170.0, 170.0, 170.0]);
    let plate = dispenses_into(wash, deck.destination_plate);
    assert_eq!(plate.len(), 16);
    assert!(plate.iter().all(|(_, v)| *v == 40.0));
    let priming = dispenses_into(wash, deck.wash_reservoir);
    assert_eq!(priming, vec![(WellName::new('A', 1).unwrap(), 10.0); 4]);

    // nothing is aspirated after the fourth set of dispenses
    let last_aspirate = wash
        .iter()
        .rposition(|c| matches!(c, DriverCommand::Aspirate { .. }))
        .unwrap();
    let last_dispense = wash
        .iter()
        .rposition(|c| matches!(c, DriverCommand::Dispense { .. }))
        .unwrap();
    assert!(last_aspirate < last_dispense);
    assert!(matches!(wash[wash.len() - 2], DriverCommand::BlowOut { into_trash: true }));

    let vacuum: Vec<_> = seq
        .checkpoints()
        .iter()
        .map(|r| &r.checkpoint)
        .filter(|c| c.stage() == AssayStage::WashAndDetectionAntibody)
        .filter(|c| c.kind() == CheckpointKind::WashVacuum)
        .map(|c| c.progress().map(|p| (p.current, p.total)))
        .collect();
    assert_eq!(vacuum, vec![Some((1, 4)), Some((2, 4)), Some((3, 4)), Some((4, 4))]);
}

#[tokio::test]
async fn scenario_c_final_iteration_resuspends_without_vacuum() {
    let mut seq = sequencer();
    for _ in 0..3 {
        seq.advance().await.unwrap();
    }
    let before = seq.driver().commands().len();
    let checkpoints_before = seq.checkpoints().len();
    let state = seq.advance().await.unwrap();
    assert_eq!(state, RunState::Done);

    let deck = *seq.deck().unwrap();
    let wash = wash_segment(&seq.driver().commands()[before..]);
    assert_eq!(aspirate_volumes(wash), vec![180.0, 170.0, 170.0, 90.0]);

    let plate = dispenses_into(wash, deck.destination_plate);
    assert_eq!(plate.len(), 16);
    assert!(plate[..12].iter().all(|(_, v)| *v == 40.0));
    assert!(plate[12..].iter().all(|(_, v)| *v == 20.0));

    let gates: Vec<_> = seq.checkpoints()[checkpoints_before..]
        .iter()
        .map(|r| (r.checkpoint.kind(), r.checkpoint.progress().map(|p| p.current)))
        .collect();
    assert_eq!(
        gates,
        vec![
            (CheckpointKind::WashVacuum, Some(1)),
            (CheckpointKind::WashVacuum, Some(2)),
            (CheckpointKind::WashVacuum, Some(3)),
        ]
    );
    let last_note = seq.notifications().last().unwrap();
    assert!(last_note.contains("4/4"));
    assert!(last_note.contains("Do not vacuum"));
}

#[tokio::test]
async fn full_run_visits_stages_in_order() {
    let mut seq = sequencer();
    let report = seq.run().await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.stages_completed, AssayStage::ALL.to_vec());

    let kinds: Vec<_> = seq
        .operator()
        .checkpoints()
        .iter()
        .map(|c| c.kind())
        .collect();
    use CheckpointKind::*;
    assert_eq!(
        kinds,
        vec![
            PlateVacuum,
            BubbleCheck,
            BeadLoading,
            Incubation,
            WashVacuum,
            WashVacuum,
            WashVacuum,
            WashVacuum,
            Incubation,
            PreWashVacuum,
            WashVacuum,
            WashVacuum,
            WashVacuum,
        ]
    );
    let terminal: Vec<_> = seq
        .operator()
        .checkpoints()
        .iter()
        .filter(|c| c.is_terminal())
        .map(|c| c.stage())
        .collect();
    assert_eq!(
        terminal,
        vec![
            AssayStage::PrewetAndAliquot,
            AssayStage::WashAndDetectionAntibody,
            AssayStage::StreptavidinPe,
        ]
    );

    for (pool, tips) in [
        ("aliquot", 12),
        ("beads", 12),
        ("detection", 12),
        ("streptavidin", 12),
        ("bulk", 1),
        ("wash", 3),
    ] {
        assert_eq!(report.tips_from(pool), tips, "pool {pool}");
    }
    for (reagent, n) in [
        (Reagent::Beads, 48),
        (Reagent::DetectionAntibody, 48),
        (Reagent::StreptavidinPe, 48),
        (Reagent::SourceSamples, 4),
        (Reagent::WashBuffer, 36),
    ] {
        assert_eq!(report.dispenses_of(reagent), n, "{reagent}");
    }
    assert!(!seq.driver().tips_on());
    assert!(report.summary().contains("done"));
}

#[tokio::test]
async fn driver_fault_halts_the_run() {
    let driver = SimulatedFlex::new().with_fault_at(40);
    let mut seq = StageSequencer::new(AssayConfig::default(), driver, AutoAcknowledge::new()).unwrap();

    let err = seq.run().await.unwrap_err();
    assert!(matches!(err, AssayError::Instrument(_)));
    match seq.state() {
        RunState::Halted { stage, reason } => {
            assert_eq!(*stage, AssayStage::PrewetAndAliquot);
            assert!(reason.contains("simulated fault"));
        }
        other => panic!("expected halted, got {other:?}"),
    }
    assert_eq!(seq.driver().commands().len(), 40);

    assert!(matches!(seq.advance().await, Err(AssayError::StageOrder(_))));
    assert!(matches!(seq.run().await, Err(AssayError::StageOrder(_))));
    assert!(seq.report().stages_completed.is_empty());
}

#[tokio::test]
async fn operator_abort_halts_before_final_wash() {
    let operator = AutoAcknowledge::refusing(CheckpointKind::PreWashVacuum);
    let mut seq = StageSequencer::new(AssayConfig::default(), SimulatedFlex::new(), operator).unwrap();

    let err = seq.run().await.unwrap_err();
    assert!(matches!(err, AssayError::OperatorAbort(_)));
    assert!(matches!(
        seq.state(),
        RunState::Halted {
            stage: AssayStage::StreptavidinPe,
            ..
        }
    ));
    assert_eq!(
        seq.report().stages_completed,
        vec![
            AssayStage::PrewetAndAliquot,
            AssayStage::WashAndDetectionAntibody
        ]
    );
}

#[tokio::test]
async fn shared_pool_runs_dry() {
    let mut config = AssayConfig::default();
    config.aliquots.standards.pool = "beads".into();
    let mut seq = StageSequencer::new(config, SimulatedFlex::new(), AutoAcknowledge::new()).unwrap();

    let err = seq.advance().await.unwrap_err();
    match err {
        AssayError::TipRackExhausted { pool, .. } => assert_eq!(pool, "beads"),
        other => panic!("expected exhaustion, got {other}"),
    }
    assert!(seq.state().is_halted());
    // 11 bead groups were served before the rack ran out
    assert_eq!(seq.report().dispenses_of(Reagent::Beads), 44);
}

#[tokio::test]
async fn channel_operator_drives_a_full_run() {
    let (operator, mut rx) = ChannelOperator::new(8);
    let harness = tokio::spawn(async move {
        let mut answered = 0;
        let mut comments = 0;
        while let Some(event) = rx.recv().await {
            match event {
                OperatorEvent::Checkpoint { response, .. } => {
                    answered += 1;
                    let _ = response.send(Acknowledgement::Proceed);
                }
                OperatorEvent::Comment(_) => comments += 1,
            }
        }
        (answered, comments)
    });

    let mut seq = StageSequencer::new(AssayConfig::default(), SimulatedFlex::new(), operator).unwrap();
    let report = seq.run().await.unwrap();
    let notes = report.notifications.len();
    drop(seq);

    let (answered, comments) = harness.await.unwrap();
    assert_eq!(answered, 13);
    assert_eq!(report.checkpoints.len(), 13);
    assert!(comments <= notes);
}

#[tokio::test]
async fn time_scaled_delays_still_complete() {
    let driver = SimulatedFlex::new().with_time_scale(0.0001);
    let mut seq = StageSequencer::new(AssayConfig::default(), driver, AutoAcknowledge::new()).unwrap();
    seq.advance().await.unwrap();
    let delays = seq
        .driver()
        .commands()
        .iter()
        .filter(|c| matches!(c, DriverCommand::Delay(_)))
        .count();
    // one settle per column tip-load, one after the bubble check
    assert_eq!(delays, 12 + 12 + 1);
}

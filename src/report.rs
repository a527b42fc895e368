//! Serializable run summary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use crate::checkpoint::GateRecord;
use crate::error::AssayResult;
use crate::labware::Reagent;
use crate::stage::{AssayStage, RunState};
use crate::transfer::PipetteStats;

/// Counters the sequencer updates as a run progresses.
#[derive(Debug, Clone)]
pub(crate) struct RunTally {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stages_completed: Vec<AssayStage>,
    pub plate_dispenses: BTreeMap<Reagent, u32>,
    pub tips_used: BTreeMap<String, u32>,
}

impl RunTally {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            stages_completed: Vec::new(),
            plate_dispenses: BTreeMap::new(),
            tips_used: BTreeMap::new(),
        }
    }

    pub fn dispensed(&mut self, reagent: Reagent, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        *self.plate_dispenses.entry(reagent).or_default() += count;
    }

    pub fn tip_used(&mut self, pool: &str) {
        *self.tips_used.entry(pool.to_string()).or_default() += 1;
    }
}

/// What happened during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique per run.
    pub run_id: Uuid,
    /// Application name from the configuration.
    pub protocol: String,
    /// When the sequencer was built.
    pub started_at: DateTime<Utc>,
    /// When the report was taken.
    pub finished_at: DateTime<Utc>,
    /// Where the run ended up.
    pub state: RunState,
    /// Stages that ran to completion, in order.
    pub stages_completed: Vec<AssayStage>,
    /// Dispenses into the destination plate, per reagent
    pub plate_dispenses: BTreeMap<Reagent, u32>,
    /// Pick-ups per tip pool
    pub tips_used: BTreeMap<String, u32>,
    /// Answered gates, oldest first.
    pub checkpoints: Vec<GateRecord>,
    /// Notifications, oldest first.
    pub notifications: Vec<String>,
    /// Pipette totals.
    pub pipette: PipetteStats,
}

impl RunReport {
    pub(crate) fn new(
        protocol: &str,
        tally: &RunTally,
        state: &RunState,
        checkpoints: &[GateRecord],
        notifications: &[String],
        pipette: PipetteStats,
    ) -> Self {
        Self {
            run_id: tally.run_id,
            protocol: protocol.to_string(),
            started_at: tally.started_at,
            finished_at: Utc::now(),
            state: state.clone(),
            stages_completed: tally.stages_completed.clone(),
            plate_dispenses: tally.plate_dispenses.clone(),
            tips_used: tally.tips_used.clone(),
            checkpoints: checkpoints.to_vec(),
            notifications: notifications.to_vec(),
            pipette,
        }
    }

    /// Plate dispenses of `reagent`, 0 if none.
    pub fn dispenses_of(&self, reagent: Reagent) -> u32 {
        self.plate_dispenses.get(&reagent).copied().unwrap_or(0)
    }

    /// Pick-ups from `pool`, 0 if none.
    pub fn tips_from(&self, pool: &str) -> u32 {
        self.tips_used.get(pool).copied().unwrap_or(0)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> AssayResult<String> {
        Ok(serde_json::to_string_pretty(self).map_err(std::io::Error::from)?)
    }

    /// Write `to_json` output to `path`.
    pub fn write_json(&self, path: &Path) -> AssayResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Human-readable summary for the console.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let elapsed = self.finished_at - self.started_at;
        let _ = writeln!(out, "Run {} ({})", self.run_id, self.protocol);
        let _ = writeln!(out, "  state:       {}", self.state);
        let _ = writeln!(out, "  elapsed:     {} s", elapsed.num_seconds());
        let _ = writeln!(out, "  checkpoints: {}", self.checkpoints.len());
        for (reagent, n) in &self.plate_dispenses {
            let _ = writeln!(out, "  {:<20} {n:>4} dispenses", reagent.as_str());
        }
        for (pool, n) in &self.tips_used {
            let _ = writeln!(out, "  tips[{pool}] {n:>4} pick-ups");
        }
        let _ = write!(
            out,
            "  pipette: {} aspirates / {:.1} µL, {} dispenses / {:.1} µL",
            self.pipette.aspirates,
            self.pipette.aspirated_ul,
            self.pipette.dispenses,
            self.pipette.dispensed_ul
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_and_json() {
        let mut tally = RunTally::new();
        tally.dispensed(Reagent::Beads, 4);
        tally.dispensed(Reagent::Beads, 4);
        tally.tip_used("beads");
        tally.stages_completed.push(AssayStage::PrewetAndAliquot);

        let report = RunReport::new(
            "test",
            &tally,
            &RunState::Done,
            &[],
            &["hello".to_string()],
            PipetteStats::default(),
        );
        assert_eq!(report.dispenses_of(Reagent::Beads), 8);
        assert_eq!(report.dispenses_of(Reagent::StreptavidinPe), 0);
        assert_eq!(report.tips_from("beads"), 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["plate_dispenses"]["beads"], 8);
        assert_eq!(json["state"]["state"], "done");
        assert_eq!(json["stages_completed"][0], "prewet_and_aliquot");
        assert!(report.summary().contains("beads"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = RunReport::new(
            "test",
            &RunTally::new(),
            &RunState::initial(),
            &[],
            &[],
            PipetteStats::default(),
        );
        report.write_json(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("run_id"));
    }
}

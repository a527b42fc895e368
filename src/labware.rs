//! Deck and labware model.
//!
//! Geometry lives with the driver; the core only needs names. A well is a
//! labware handle plus a `WellName`, and a `WellPosition` adds the optional
//! bottom offset used when aspirating or dispensing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AssayError;

/// Row-letter/column-number address of a well, e.g. `A1` or `P24`.
///
/// Rows are stored zero-based (`A` = 0); columns are one-based as printed
/// on the plate. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WellName {
    row: u8,
    column: u8,
}

impl WellName {
    /// Build a well name from a row letter and a 1-based column.
    pub fn new(row: char, column: u8) -> Result<Self, AssayError> {
        let upper = row.to_ascii_uppercase();
        if !upper.is_ascii_uppercase() || column == 0 {
            return Err(AssayError::Configuration(format!(
                "invalid well address {row}{column}"
            )));
        }
        Ok(Self {
            row: upper as u8 - b'A',
            column,
        })
    }

    /// Build from zero-based row and one-based column indices.
    pub(crate) const fn from_indices(row: u8, column: u8) -> Self {
        Self { row, column }
    }

    /// Zero-based row index.
    pub fn row_index(&self) -> u8 {
        self.row
    }

    /// Row letter.
    pub fn row_letter(&self) -> char {
        (b'A' + self.row) as char
    }

    /// One-based column number.
    pub fn column(&self) -> u8 {
        self.column
    }
}

impl fmt::Display for WellName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_letter(), self.column)
    }
}

impl FromStr for WellName {
    type Err = AssayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        let row = chars
            .next()
            .ok_or_else(|| AssayError::Configuration("empty well address".into()))?;
        let column = chars
            .as_str()
            .parse::<u8>()
            .map_err(|_| AssayError::Configuration(format!("invalid well address '{s}'")))?;
        WellName::new(row, column)
    }
}

impl Serialize for WellName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WellName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Grid dimensions of a plate or reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateFormat {
    /// Row count.
    pub rows: u8,
    /// Column count.
    pub columns: u8,
}

impl PlateFormat {
    /// 8 x 12 plate.
    pub const WELLS_96: PlateFormat = PlateFormat { rows: 8, columns: 12 };
    /// 16 x 24 plate.
    pub const WELLS_384: PlateFormat = PlateFormat { rows: 16, columns: 24 };
    /// 12-channel reservoir.
    pub const RESERVOIR_12: PlateFormat = PlateFormat { rows: 1, columns: 12 };
    /// Single-well reservoir.
    pub const RESERVOIR_1: PlateFormat = PlateFormat { rows: 1, columns: 1 };
    /// Tip racks use the 96 layout.
    pub const TIP_RACK: PlateFormat = PlateFormat::WELLS_96;

    /// Number of wells.
    pub fn well_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    /// Whether `well` lies on this grid.
    pub fn contains(&self, well: WellName) -> bool {
        well.row < self.rows && well.column >= 1 && well.column <= self.columns
    }

    /// Every well, row-major.
    pub fn wells(&self) -> impl Iterator<Item = WellName> + '_ {
        (0..self.rows)
            .flat_map(move |row| (1..=self.columns).map(move |col| WellName::from_indices(row, col)))
    }
}

/// What a piece of labware is used for on the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabwareRole {
    /// 96-well plate with samples and standards.
    SourcePlate,
    /// 384-well filter plate.
    DestinationPlate,
    /// 12-well reagent reservoir.
    ReagentReservoir,
    /// Single-well wash reservoir.
    WashReservoir,
    /// Tip rack.
    TipRack,
    /// Trash bin.
    Trash,
}

/// Load request handed to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabwareSpec {
    /// Driver-side labware definition name, e.g. `agilent_384_wellplate_140ul`.
    pub kind: String,
    /// Deck slot, e.g. `D1`.
    pub slot: String,
    /// Name in logs and reports.
    pub label: String,
    /// What it is used for.
    pub role: LabwareRole,
    /// Well grid.
    pub format: PlateFormat,
    /// Adapter definition the labware sits on, if any.
    #[serde(default)]
    pub adapter: Option<String>,
}

/// Opaque handle returned by the driver after loading labware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabwareHandle(pub u32);

impl fmt::Display for LabwareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "labware#{}", self.0)
    }
}

/// A well on a loaded piece of labware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Well {
    /// Labware holding the well.
    pub labware: LabwareHandle,
    /// Position on the grid.
    pub name: WellName,
}

impl Well {
    /// The well `name` of `labware`.
    pub fn new(labware: LabwareHandle, name: WellName) -> Self {
        Self { labware, name }
    }

    /// Position at the driver's default height for this well.
    pub fn default_position(self) -> WellPosition {
        WellPosition {
            well: self,
            bottom_offset_mm: None,
        }
    }

    /// Position `z` mm above the well bottom.
    pub fn bottom(self, z: f64) -> WellPosition {
        WellPosition {
            well: self,
            bottom_offset_mm: Some(z),
        }
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.name, self.labware)
    }
}

/// Where in a well the pipette acts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WellPosition {
    /// Target well.
    pub well: Well,
    /// Height above the well bottom; `None` leaves the driver default.
    pub bottom_offset_mm: Option<f64>,
}

/// Blow-out / drop target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    /// Trash bin.
    Trash(LabwareHandle),
    /// A well at a given height.
    Well(WellPosition),
}

/// Liquids handled by the assay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reagent {
    /// Wash reservoir contents.
    WashBuffer,
    /// Matrix for the standards group.
    StandardMatrix,
    /// Assay buffer for the sample wells.
    SampleBuffer,
    /// Samples and standards on the 96-well source plate.
    SourceSamples,
    /// Capture beads.
    Beads,
    /// Biotinylated detection antibody.
    DetectionAntibody,
    /// Streptavidin-PE.
    StreptavidinPe,
}

impl Reagent {
    /// Lower-case name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reagent::WashBuffer => "wash buffer",
            Reagent::StandardMatrix => "standard matrix",
            Reagent::SampleBuffer => "sample buffer",
            Reagent::SourceSamples => "source samples",
            Reagent::Beads => "beads",
            Reagent::DetectionAntibody => "detection antibody",
            Reagent::StreptavidinPe => "streptavidin-PE",
        }
    }
}

impl fmt::Display for Reagent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! 96 → 384 quadrant mapping.
//!
//! A 384-well plate interleaves four 96-well grids. Anchoring the head at
//! `A1`, `A2`, `B1` and `B2` reaches each of the four quadrants once, so one
//! source position feeds a group of four destination anchors. The 12 groups
//! walk the odd destination columns: group `i` anchors at
//! `A(2i+1), A(2i+2), B(2i+1), B(2i+2)`.

use std::fmt;

use crate::labware::{PlateFormat, WellName};
use crate::nozzle::NozzleStyle;

/// Number of quadrant groups on a 384 plate paired with a 96 source.
pub const GROUP_COUNT: usize = 12;

/// Position of an anchor within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    /// `A(2i+1)`
    TopLeft,
    /// `A(2i+2)`
    TopRight,
    /// `B(2i+1)`
    BottomLeft,
    /// `B(2i+2)`
    BottomRight,
}

impl Quadrant {
    /// In anchor order.
    pub const ALL: [Quadrant; 4] = [
        Quadrant::TopLeft,
        Quadrant::TopRight,
        Quadrant::BottomLeft,
        Quadrant::BottomRight,
    ];
}

/// Four destination anchors fed from one origin position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellGroup {
    index: usize,
    wells: [WellName; 4],
}

impl WellGroup {
    fn at(index: usize) -> Self {
        // 1-based left column of the pair
        let col = (2 * index + 1) as u8;
        Self {
            index,
            wells: [
                WellName::from_indices(0, col),
                WellName::from_indices(0, col + 1),
                WellName::from_indices(1, col),
                WellName::from_indices(1, col + 1),
            ],
        }
    }

    /// Zero-based group index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Anchors in `{top-left, top-right, bottom-left, bottom-right}` order.
    pub fn wells(&self) -> &[WellName; 4] {
        &self.wells
    }

    /// Anchor well for `quadrant`.
    pub fn well(&self, quadrant: Quadrant) -> WellName {
        match quadrant {
            Quadrant::TopLeft => self.wells[0],
            Quadrant::TopRight => self.wells[1],
            Quadrant::BottomLeft => self.wells[2],
            Quadrant::BottomRight => self.wells[3],
        }
    }

    /// Destination wells physically reached when the head, in `style`,
    /// visits all four anchors of this group.
    ///
    /// Channels sit on a 9 mm pitch, which is every other row (and column)
    /// of a 384 plate. A column-partial head therefore covers the anchor's
    /// column on alternating rows; a full-plate head covers alternating
    /// rows and columns across the whole plate.
    pub fn footprint(&self, style: NozzleStyle) -> Vec<WellName> {
        let format = PlateFormat::WELLS_384;
        let mut wells = Vec::new();
        for anchor in &self.wells {
            let rows = (anchor.row_index()..format.rows).step_by(2);
            match style {
                NozzleStyle::ColumnPartial => {
                    wells.extend(rows.map(|row| WellName::from_indices(row, anchor.column())));
                }
                NozzleStyle::FullPlate => {
                    for row in rows {
                        wells.extend(
                            (anchor.column()..=format.columns)
                                .step_by(2)
                                .map(|col| WellName::from_indices(row, col)),
                        );
                    }
                }
            }
        }
        wells
    }
}

impl fmt::Display for WellGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [tl, tr, bl, br] = self.wells;
        write!(f, "group {} [{tl} {tr} {bl} {br}]", self.index)
    }
}

/// Stateless source of quadrant groups.
///
/// Every call rebuilds the same ordered sequence, so callers can slice it as
/// often as they like without worrying about a shared cursor.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellQuadrantMapper;

impl WellQuadrantMapper {
    /// The mapper has no state.
    pub fn new() -> Self {
        Self
    }

    /// All groups, ordered by ascending destination column pair.
    pub fn groups(&self) -> Vec<WellGroup> {
        (0..GROUP_COUNT).map(WellGroup::at).collect()
    }

    /// Group `index`, if it is below 12.
    pub fn group(&self, index: usize) -> Option<WellGroup> {
        (index < GROUP_COUNT).then(|| WellGroup::at(index))
    }

    /// Group 0, which receives the standard curve.
    pub fn standards_group(&self) -> WellGroup {
        WellGroup::at(0)
    }

    /// Groups 1..=11, which receive samples.
    pub fn sample_groups(&self) -> Vec<WellGroup> {
        (1..GROUP_COUNT).map(WellGroup::at).collect()
    }

    /// Every group, standards first.
    pub fn all_groups(&self) -> Vec<WellGroup> {
        self.groups()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn name(s: &str) -> WellName {
        s.parse().unwrap()
    }

    #[test]
    fn test_group_anchor_rule() {
        let mapper = WellQuadrantMapper::new();
        let groups = mapper.groups();
        assert_eq!(groups.len(), GROUP_COUNT);
        for (i, group) in groups.iter().enumerate() {
            let col = 2 * i as u8 + 1;
            assert_eq!(group.index(), i);
            assert_eq!(
                group.wells(),
                &[
                    WellName::new('A', col).unwrap(),
                    WellName::new('A', col + 1).unwrap(),
                    WellName::new('B', col).unwrap(),
                    WellName::new('B', col + 1).unwrap(),
                ]
            );
        }
        assert_eq!(groups[11].well(Quadrant::BottomRight), name("B24"));
    }

    #[test]
    fn test_group_display() {
        let group = WellQuadrantMapper::new().group(3).unwrap();
        assert_eq!(group.to_string(), "group 3 [A7 A8 B7 B8]");
    }

    #[test]
    fn test_groups_are_deterministic() {
        let mapper = WellQuadrantMapper::new();
        assert_eq!(mapper.groups(), mapper.groups());
    }

    #[test]
    fn test_named_ranges_partition_all_groups() {
        let mapper = WellQuadrantMapper::new();
        let mut joined = vec![mapper.standards_group()];
        joined.extend(mapper.sample_groups());
        assert_eq!(joined, mapper.all_groups());
        assert_eq!(mapper.sample_groups().len(), 11);
        assert!(mapper.group(12).is_none());
    }

    #[test]
    fn test_column_footprints_tile_the_plate() {
        let mapper = WellQuadrantMapper::new();
        let mut seen = HashSet::new();
        for group in mapper.groups() {
            let footprint = group.footprint(NozzleStyle::ColumnPartial);
            assert_eq!(footprint.len(), 32);
            for well in footprint {
                assert!(seen.insert(well), "{well} covered twice");
            }
        }
        assert_eq!(seen.len(), PlateFormat::WELLS_384.well_count());
    }

    #[test]
    fn test_full_plate_footprint_of_group_zero_is_whole_plate() {
        let group = WellQuadrantMapper::new().standards_group();
        let wells: HashSet<_> = group.footprint(NozzleStyle::FullPlate).into_iter().collect();
        assert_eq!(wells.len(), 384);
        assert!(wells.contains(&name("P24")));
    }
}

//! Sequencing core for a LEGENDplex-style bead immunoassay on a 96-channel
//! liquid handler.
//!
//! The crate maps a 96-well source onto 384-well quadrant groups, tracks
//! nozzle layouts and tip racks across full-plate and column pick-ups, and
//! walks the assay through its four stages with operator checkpoints in
//! between. Hardware sits behind the [`driver::LiquidHandler`] trait;
//! [`driver::SimulatedFlex`] runs everything without a robot.
//!
//! ```no_run
//! use flex_assay::checkpoint::AutoAcknowledge;
//! use flex_assay::config::AssayConfig;
//! use flex_assay::driver::SimulatedFlex;
//! use flex_assay::sequencer::StageSequencer;
//!
//! #[tokio::main]
//! async fn main() -> flex_assay::AssayResult<()> {
//!     let config = AssayConfig::load()?;
//!     let mut run = StageSequencer::new(config, SimulatedFlex::new(), AutoAcknowledge::new())?;
//!     let report = run.run().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod labware;
pub mod logging;
pub mod nozzle;
pub mod quadrant;
pub mod report;
pub mod sequencer;
pub mod stage;
pub mod transfer;
pub mod wash;

pub use error::{AssayError, AssayResult};
pub use sequencer::StageSequencer;
pub use stage::{AssayStage, RunState};

//! Assay configuration using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is merged from (lowest to highest precedence):
//! 1. Built-in defaults (the LEGENDplex CD8/NK panel)
//! 2. TOML configuration file (default: `config/legendplex_cd8_nk.toml`)
//! 3. Environment variables prefixed with `FLEXASSAY_`
//!
//! # Example
//!
//! ```no_run
//! use flex_assay::config::AssayConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from default location
//!     let config = AssayConfig::load()?;
//!
//!     // Or load from custom location
//!     let config = AssayConfig::load_from("custom/plate.toml")?;
//!
//!     println!("Protocol: {}", config.application.name);
//!     println!("Wash iterations: {}", config.wash.wash_loop.iterations);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! FLEXASSAY_APPLICATION__LOG_LEVEL=debug
//! FLEXASSAY_PIPETTING__WASH_RATE=2.5
//! FLEXASSAY_WASH__WASH_LOOP__REPLENISH_UL=165
//! ```

pub mod assay_config;

pub use assay_config::{
    AliquotConfig, AliquotRecipe, ApplicationConfig, AssayConfig, DeckConfig, LabwareSlot,
    PipettingConfig, PrewetConfig, ReagentWells, TipPoolConfig, WashConfig, DEFAULT_CONFIG_PATH,
};

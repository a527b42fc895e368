//! flex_assay - command-line entry point
//!
//! Runs the assay on the simulated liquid handler, checks a configuration
//! without running it, or prints the quadrant map.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use flex_assay::checkpoint::{AutoAcknowledge, ConsoleOperator, Operator};
use flex_assay::config::AssayConfig;
use flex_assay::driver::SimulatedFlex;
use flex_assay::nozzle::NozzleStyle;
use flex_assay::quadrant::WellQuadrantMapper;
use flex_assay::wash::{IterationKind, WashLoopPlan};
use flex_assay::{logging, StageSequencer};

/// Command-line arguments for flex_assay
#[derive(Parser, Debug)]
#[command(name = "flex_assay")]
#[command(about = "96 to 384 bead immunoassay sequencer for a 96-channel liquid handler")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to config/legendplex_cd8_nk.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full assay on the simulated deck
    Run {
        /// Acknowledge every checkpoint automatically
        #[arg(long)]
        auto_ack: bool,

        /// Write a JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Fraction of each settle delay to actually wait (0 skips them)
        #[arg(long, default_value_t = 0.0)]
        time_scale: f64,
    },
    /// Validate the configuration and print the wash schedules
    Check {
        /// Also print the merged configuration as TOML
        #[arg(long)]
        print_config: bool,
    },
    /// Print the 96 to 384 quadrant groups
    Groups,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AssayConfig::load_from(path),
        None => AssayConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
        config.validate()?;
    }
    logging::init(&config.application.log_level)?;

    match cli.command {
        Command::Run {
            auto_ack,
            report,
            time_scale,
        } => {
            let driver = SimulatedFlex::new().with_time_scale(time_scale);
            if auto_ack {
                drive(StageSequencer::new(config, driver, AutoAcknowledge::new())?, report).await
            } else {
                drive(StageSequencer::new(config, driver, ConsoleOperator::new())?, report).await
            }
        }
        Command::Check { print_config } => check(config, print_config),
        Command::Groups => {
            print_groups();
            Ok(())
        }
    }
}

async fn drive<O: Operator>(
    mut sequencer: StageSequencer<SimulatedFlex, O>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let outcome = sequencer.run().await;
    let report = sequencer.report();

    if let Some(path) = &report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Run report written to {}", path.display());
    }
    println!("{}", report.summary());

    outcome.map(|_| ()).context("Assay run halted")
}

fn check(config: AssayConfig, print_config: bool) -> Result<()> {
    let sequencer = StageSequencer::new(config, SimulatedFlex::new(), AutoAcknowledge::new())
        .context("Configuration rejected")?;
    let config = sequencer.config();

    println!("Configuration OK: {}", config.application.name);
    for pool in &config.deck.tip_pools {
        println!(
            "  pool {:<13} {:>5.0} µL tips in {} {}",
            pool.name,
            pool.tip_volume_ul,
            pool.slots.join(", "),
            if pool.adapter.is_some() { "(adapter)" } else { "" }
        );
    }
    print_schedule("wash before detection antibody", &config.wash.wash_loop);
    print_schedule("final wash and resuspend", &config.wash.final_loop);

    if print_config {
        let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
        println!("\n{rendered}");
    }
    Ok(())
}

fn print_schedule(title: &str, plan: &WashLoopPlan) {
    println!("\n{title}: fill {} µL", plan.initial_aspirate_ul);
    for it in plan.schedule() {
        let after = match (it.kind, it.refill_after_ul) {
            (IterationKind::Resuspend, _) => "notify".to_string(),
            (IterationKind::Wash, Some(refill)) => format!("refill {refill} µL, vacuum"),
            (IterationKind::Wash, None) => "vacuum".to_string(),
        };
        println!(
            "  {}/{}  prime {} + 4 x {} µL  held {} -> {} µL  {after}",
            it.number, it.total, it.priming_ul, it.per_well_ul, it.held_before_ul, it.held_after_ul
        );
    }
}

fn print_groups() {
    let mapper = WellQuadrantMapper::new();
    let standards = mapper.standards_group().index();
    for group in mapper.groups() {
        let role = if group.index() == standards {
            "standards"
        } else {
            "samples"
        };
        println!(
            "{:<28} {role:<10} column footprint {} wells",
            group.to_string(),
            group.footprint(NozzleStyle::ColumnPartial).len()
        );
    }
}

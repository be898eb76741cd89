//! # HH CLI
//!
//! Command-line runner for the Hodgkin-Huxley membrane simulator.
//!
//! Produces data only; plotting is left to whatever reads the exported trace.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use hh_core::{RateCoefficients, SimulationConfig};
use hh_sim::{Simulation, Trace};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "hh")]
#[command(author = "Yatrogenesis")]
#[command(version)]
#[command(about = "Hodgkin-Huxley action potential simulator", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation and optionally export the trace
    Run(RunArgs),

    /// Print the default configuration as JSON
    Defaults,

    /// Print the rate coefficients at a displacement from rest
    Rates {
        /// Displacement from rest (mV)
        #[arg(long, allow_negative_numbers = true)]
        vp: f64,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file (missing fields take defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stimulus amplitude (mA/cm^2)
    #[arg(long, allow_negative_numbers = true)]
    amplitude: Option<f64>,

    /// Stimulus pulse duration (s)
    #[arg(long)]
    pulse: Option<f64>,

    /// Integration step (s)
    #[arg(long)]
    dt: Option<f64>,

    /// Total simulated time (s)
    #[arg(long)]
    duration: Option<f64>,

    /// Write the trace to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
    format: ExportFormat,

    /// Record samples where m, h or n leave [0, 1]
    #[arg(long)]
    flag_gates: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

impl RunArgs {
    /// Defaults, then the config file, then individual flags.
    fn resolve_config(&self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SimulationConfig::default(),
        };

        if let Some(amplitude) = self.amplitude {
            config.stimulus_amplitude = amplitude;
        }
        if let Some(pulse) = self.pulse {
            config.pulse_duration = pulse;
        }
        if let Some(dt) = self.dt {
            config.dt = dt;
        }
        if let Some(duration) = self.duration {
            config.total_time = duration;
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Run(args) => run(&args)?,

        Commands::Defaults => {
            println!("{}", SimulationConfig::default().to_json_pretty()?);
        }

        Commands::Rates { vp } => {
            let rates = RateCoefficients::at(vp)?;
            println!("{} Vp = {} mV", "Rate coefficients (1/ms) at".green().bold(), vp);
            for (name, value) in rates.named() {
                println!("  {:>3} = {:.6}", name.cyan(), value);
            }
            println!("{}", "Steady states:".green().bold());
            println!("  {:>3} = {:.6}", "m".cyan(), rates.m().steady_state());
            println!("  {:>3} = {:.6}", "h".cyan(), rates.h().steady_state());
            println!("  {:>3} = {:.6}", "n".cyan(), rates.n().steady_state());
        }
    }

    Ok(())
}

fn run(args: &RunArgs) -> anyhow::Result<()> {
    let config = args.resolve_config()?;
    let simulation = Simulation::new(config)
        .context("Invalid simulation configuration")?
        .flag_gate_excursions(args.flag_gates);

    info!(samples = simulation.len(), "running simulation");

    let trace = if args.progress {
        let pb = ProgressBar::new(simulation.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} steps")?
                .progress_chars("=> "),
        );
        let trace = simulation.run_with(|index, _| {
            if index % 1000 == 0 {
                pb.set_position(index as u64);
            }
        });
        pb.finish_and_clear();
        trace?
    } else {
        simulation.run()?
    };

    print_summary(&trace);

    if let Some(path) = &args.output {
        match args.format {
            ExportFormat::Json => {
                let json = serde_json::to_string_pretty(&trace)?;
                std::fs::write(path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            ExportFormat::Csv => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                write_csv(&trace, file)?;
            }
        }
        println!("{} Export complete: {}", "[OK]".green().bold(), path.display());
    }

    Ok(())
}

/// One row per sample: time in ms, state, stimulus.
fn write_csv<W: Write>(trace: &Trace, writer: W) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for sample in trace.samples() {
        wtr.serialize(sample)?;
    }
    wtr.flush()?;
    Ok(())
}

fn print_summary(trace: &Trace) {
    println!("{}", "Simulation complete".green().bold());
    println!("  Samples:        {}", trace.len());
    println!("  Step:           {} us", trace.config.dt * 1.0e6);

    if let Some((t, v)) = trace.peak() {
        println!("  Peak:           {:.2} mV at {:.3} ms", v, t * 1.0e3);
    }

    let spikes = trace.spike_times(0.0);
    let label = format!("{}", spikes.len());
    println!(
        "  Spikes (0 mV):  {}",
        if spikes.is_empty() { label.yellow() } else { label.cyan() }
    );

    if !spikes.is_empty() {
        if let Some(t) = trace.return_to_rest(5.0) {
            println!("  Back to rest:   {:.3} ms", t * 1.0e3);
        }
    }

    if !trace.gate_excursions.is_empty() {
        println!(
            "  {} {} samples with a gate outside [0, 1] (first at index {})",
            "Warning:".yellow().bold(),
            trace.gate_excursions.len(),
            trace.gate_excursions[0]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::try_parse_from([
            "hh", "run", "--amplitude", "0", "--dt", "2e-5", "--duration", "5e-3", "--format", "json",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.format, ExportFormat::Json);

        let config = args.resolve_config().unwrap();
        assert_eq!(config.stimulus_amplitude, 0.0);
        assert_eq!(config.dt, 2.0e-5);
        assert_eq!(config.total_time, 5.0e-3);
        assert_eq!(config.v_rest, -65.0);
    }

    #[test]
    fn test_negative_displacement_parses() {
        let cli = Cli::try_parse_from(["hh", "rates", "--vp", "-30"]).unwrap();
        assert!(matches!(cli.command, Commands::Rates { vp } if vp == -30.0));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::try_parse_from(["hh", "run", "--config", "/nonexistent/hh.json"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.resolve_config().is_err());
    }

    #[test]
    fn test_write_csv() {
        let config = SimulationConfig::default().with_timing(2.0e-5, 1.0e-3);
        let trace = Simulation::new(config).unwrap().run().unwrap();

        let mut buf = Vec::new();
        write_csv(&trace, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "time_ms,voltage,m,h,n,g_na,g_k,stimulus");
        assert_eq!(lines.len(), trace.len() + 1);
        assert!(lines[1].starts_with("0.0,-65.0,"));
    }
}

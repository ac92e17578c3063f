use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use insulopt_core::dynamics::{check_partials, NodeInputs, ThermalOde};
use insulopt_core::simulate::{sample_times, simulate, IntegrationMethod};
use insulopt_core::{run_optimization, ProblemConfig, SolveError};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "insulopt")]
#[command(about = "Minimum insulation thickness by Gauss-Lobatto collocation", long_about = None)]
struct Cli {
    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize the insulation thickness
    Solve {
        /// Problem YAML file (defaults to the reference problem)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Upper bound on the final temperature, K
        #[arg(long)]
        upper_bound: Option<f64>,
        /// Number of transcription segments
        #[arg(long)]
        segments: Option<usize>,
        /// Gauss-Lobatto order (odd, >= 3)
        #[arg(long)]
        order: Option<usize>,
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the optimal timeseries as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Integrate the cell forward for a given thickness
    Simulate {
        /// Problem YAML file (defaults to the reference problem)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Insulation thickness, m
        #[arg(long)]
        thickness: Option<f64>,
        /// Integrator
        #[arg(long, value_enum)]
        method: Option<Method>,
        /// Largest RK4 step, s
        #[arg(long)]
        step: Option<f64>,
        /// Output CSV file path (optional, defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compare the analytic model partials with dual numbers and finite differences
    CheckPartials {
        /// Problem YAML file (defaults to the reference problem)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Temperature to linearize at, K
        #[arg(long, default_value_t = 333.15)]
        temperature: f64,
        /// Relative finite-difference step
        #[arg(long, default_value_t = 1e-6)]
        step: f64,
        /// Largest accepted relative error
        #[arg(long, default_value_t = 1e-6)]
        tolerance: f64,
    },
    /// Print the default configuration as YAML
    Defaults,
}

#[derive(Clone, Copy, ValueEnum)]
enum Method {
    Rk4,
    Tsit5,
}

impl From<Method> for IntegrationMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Rk4 => IntegrationMethod::Rk4,
            Method::Tsit5 => IntegrationMethod::Tsit5,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Solve {
            config,
            upper_bound,
            segments,
            order,
            output,
            csv,
        } => cmd_solve(
            config.as_deref(),
            upper_bound,
            segments,
            order,
            output.as_deref(),
            csv.as_deref(),
        ),
        Commands::Simulate {
            config,
            thickness,
            method,
            step,
            output,
        } => cmd_simulate(config.as_deref(), thickness, method, step, output.as_deref()),
        Commands::CheckPartials {
            config,
            temperature,
            step,
            tolerance,
        } => cmd_check_partials(config.as_deref(), temperature, step, tolerance),
        Commands::Defaults => {
            print!("{}", ProblemConfig::default().to_yaml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProblemConfig> {
    match path {
        Some(path) => ProblemConfig::load(path),
        None => Ok(ProblemConfig::default()),
    }
}

/// Opens `path` for writing, or stdout when absent.
fn writer(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    })
}

fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let mut out = writer(path)?;
    serde_json::to_writer_pretty(&mut out, value).context("Failed to serialize report")?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn write_csv(path: Option<&Path>, header: &str, times: &[f64], values: &[f64]) -> Result<()> {
    let mut out = writer(path)?;
    writeln!(out, "{header}")?;
    for (t, v) in times.iter().zip(values) {
        writeln!(out, "{t},{v}")?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_solve(
    config_path: Option<&Path>,
    upper_bound: Option<f64>,
    segments: Option<usize>,
    order: Option<usize>,
    output: Option<&Path>,
    csv: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(upper) = upper_bound {
        config = config.with_final_upper_bound(upper);
    }
    if let Some(segments) = segments {
        config.transcription.num_segments = segments;
        config.transcription.segment_ends = None;
    }
    if let Some(order) = order {
        config.transcription.order = order;
    }

    let report = match run_optimization(&config) {
        Ok(report) => report,
        Err(err) => {
            if let Some(solve) = err.downcast_ref::<SolveError>() {
                if solve.is_infeasible() {
                    bail!("No insulation thickness satisfies the constraints: {solve}");
                }
            }
            return Err(err);
        }
    };

    eprintln!(
        "✓ d = {:.8} m, final temperature {:.4} K ({} iterations)",
        report.thickness, report.final_temperature, report.iterations
    );
    if !report.verification.passed {
        eprintln!(
            "! forward integration differs by {:.3e} K (tolerance {:.1e} K)",
            report.verification.max_difference, report.verification.tolerance
        );
    }

    write_json(&report, output)?;
    if let Some(path) = csv {
        let series = &report.solution.timeseries;
        write_csv(Some(path), "time,temperature", &series.time, &series.temperature)?;
    }
    Ok(())
}

fn cmd_simulate(
    config_path: Option<&Path>,
    thickness: Option<f64>,
    method: Option<Method>,
    step: Option<f64>,
    output: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let physics = config
        .physics
        .with_thickness(thickness.unwrap_or(config.physics.thickness));
    let mut settings = config.simulation;
    if let Some(method) = method {
        settings.method = method.into();
    }
    if let Some(step) = step {
        settings.fixed_step = step;
    }

    let times = sample_times(
        config.time.t_initial,
        config.time.t_duration,
        settings.output_points,
    );
    let run = simulate(&physics, config.state.initial, &times, &settings)
        .context("Forward simulation failed")?;
    if let Some(last) = run.final_temperature() {
        eprintln!(
            "✓ final temperature {last:.4} K after {} steps ({} rejected)",
            run.steps, run.rejected_steps
        );
    }
    write_csv(output, "time,temperature", &run.times, &run.temperatures)
}

fn cmd_check_partials(
    config_path: Option<&Path>,
    temperature: f64,
    step: f64,
    tolerance: f64,
) -> Result<()> {
    let config = load_config(config_path)?;
    let inputs = NodeInputs::broadcast(&config.physics, &[temperature]);
    inputs.validate()?;
    let checks = check_partials(&ThermalOde::new(1), &inputs, step);

    println!(
        "{:<4} {:>12} {:>12} {:>12} {:>12}",
        "wrt", "dual abs", "dual rel", "fd abs", "fd rel"
    );
    for check in &checks {
        println!(
            "{:<4} {:>12.3e} {:>12.3e} {:>12.3e} {:>12.3e}",
            check.input.symbol(),
            check.dual_abs_error,
            check.dual_rel_error,
            check.fd_abs_error,
            check.fd_rel_error
        );
    }

    let failed: Vec<&str> = checks
        .iter()
        .filter(|c| !c.within(tolerance))
        .map(|c| c.input.symbol())
        .collect();
    if !failed.is_empty() {
        bail!("Partials exceed tolerance {tolerance:e} for: {}", failed.join(", "));
    }
    println!("✓ All partials within {tolerance:e}");
    Ok(())
}

//! gecal CLI

mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ge_calib::{CalibrationConfig, calibrate, reference_energies};
use ge_core::{Diagnostic, DiagnosticsSink, Level};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "gecal")]
#[command(about = "gecal - Automatic HPGe energy calibration")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate raw energies against reference lines
    Calibrate {
        /// Raw energies: whitespace separated text, or a JSON array (.json)
        #[arg(short, long)]
        input: PathBuf,

        /// Calibration config (YAML, or JSON when the extension is .json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Built-in reference lines (th228, uwmjlab)
        #[arg(long, conflicts_with = "peaks")]
        source: Option<String>,

        /// Reference energies in keV, comma separated
        #[arg(long, value_delimiter = ',')]
        peaks: Option<Vec<f64>>,

        /// Approximate keV per raw unit
        #[arg(long)]
        guess_kev: f64,

        /// Polynomial degree (overrides the config)
        #[arg(long)]
        deg: Option<usize>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Write a synthetic spectrum
    Simulate {
        /// Built-in reference lines to place in the spectrum
        #[arg(long, default_value = "th228")]
        source: String,

        /// Raw units per keV
        #[arg(long, default_value = "3.0")]
        scale: f64,

        /// Raw offset
        #[arg(long, default_value = "0.0")]
        offset: f64,

        /// Continuum events
        #[arg(long, default_value = "200000")]
        events: usize,

        /// Events per line
        #[arg(long, default_value = "5000")]
        line_events: usize,

        /// Mean of the exponential continuum (keV)
        #[arg(long, default_value = "800.0")]
        continuum_slope: f64,

        /// Round raw values to integers
        #[arg(long)]
        integer: bool,

        /// RNG seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output file: text, or a JSON array when the extension is .json
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Forwards pipeline diagnostics to `tracing`.
struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, d: Diagnostic) {
        match d.level {
            Level::Debug => tracing::debug!(stage = %d.stage, "{}", d.message),
            Level::Info => tracing::info!(stage = %d.stage, "{}", d.message),
            Level::Warn => tracing::warn!(stage = %d.stage, "{}", d.message),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Calibrate { input, config, source, peaks, guess_kev, deg, output, threads } => {
            cmd_calibrate(
                &input,
                config.as_ref(),
                source.as_deref(),
                peaks,
                guess_kev,
                deg,
                output.as_ref(),
                threads,
            )
        }
        Commands::Simulate {
            source,
            scale,
            offset,
            events,
            line_events,
            continuum_slope,
            integer,
            seed,
            output,
        } => {
            let spec = simulate::SpectrumSpec {
                lines_kev: reference_energies(&source)?,
                line_events,
                continuum_events: events,
                continuum_slope_kev: continuum_slope,
                scale,
                offset,
                integer,
                seed,
            };
            cmd_simulate(&spec, &output)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_calibrate(
    input: &PathBuf,
    config: Option<&PathBuf>,
    source: Option<&str>,
    peaks: Option<Vec<f64>>,
    guess_kev: f64,
    deg: Option<usize>,
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }

    let mut cfg = match config {
        Some(path) => CalibrationConfig::from_path(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => CalibrationConfig::default(),
    };
    if let Some(d) = deg {
        cfg.degree = d;
    }
    let refs = match (source, peaks) {
        (_, Some(p)) => p,
        (Some(name), None) => reference_energies(name)?,
        (None, None) => reference_energies("th228")?,
    };

    let raw = read_raw(input)?;
    tracing::info!(path = %input.display(), n = raw.len(), "raw energies loaded");

    let result = calibrate(&raw, &refs, guess_kev, &cfg, &TracingSink)?;
    match result.polynomial() {
        Some(p) => tracing::info!(peaks = result.peaks.len(), "calibration: {p}"),
        None => tracing::warn!("too few peaks fitted for a degree {} calibration", cfg.degree),
    }

    write_json(output, serde_json::to_value(&result)?)
}

fn cmd_simulate(spec: &simulate::SpectrumSpec, output: &Path) -> Result<()> {
    let raw = simulate::generate(spec)?;
    tracing::info!(n = raw.len(), path = %output.display(), "writing synthetic spectrum");
    if is_json(output) {
        std::fs::write(output, serde_json::to_string(&raw)?)?;
    } else {
        let text: String = raw.iter().map(|x| format!("{x}\n")).collect();
        std::fs::write(output, text)?;
    }
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Read raw energies from text (whitespace separated, `#` comments) or a JSON array.
fn read_raw(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if is_json(path) || text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&text)?);
    }
    parse_text(&text)
}

fn parse_text(text: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("");
        for tok in line.split_whitespace() {
            let v: f64 = tok
                .parse()
                .with_context(|| format!("line {}: invalid number '{tok}'", lineno + 1))?;
            out.push(v);
        }
    }
    Ok(out)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text() {
        let v = parse_text("# header\n1.5 2\n\n3e2 # trailing\n").unwrap();
        assert_eq!(v, vec![1.5, 2.0, 300.0]);
        assert!(parse_text("1.0 abc").is_err());
    }

    #[test]
    fn test_is_json() {
        assert!(is_json(Path::new("a/b.JSON")));
        assert!(!is_json(Path::new("a/b.txt")));
    }
}

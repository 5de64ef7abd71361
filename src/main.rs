//! driftreg - register a drifting image sequence onto a reference frame
//!
//! Frames are read from a directory, backed up once, tracked and resampled
//! into the coordinates of the reference frame, and written back in place.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use driftreg::config::Config;
use driftreg::registration::{Direction, Point, Sequencer};
use driftreg::sequence::DirectorySequence;
use driftreg::warp::Backend;

/// driftreg - feature-tracked drift registration for image sequences
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "driftreg.toml")]
    config: PathBuf,

    /// Directory holding the frames
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Reference frame index
    #[arg(short, long)]
    reference: Option<usize>,

    /// First frame of the range
    #[arg(long)]
    start: Option<usize>,

    /// Last frame of the range
    #[arg(long)]
    end: Option<usize>,

    /// Walk the range backward
    #[arg(long, conflicts_with = "both")]
    reverse: bool,

    /// Walk backward from the reference, then forward
    #[arg(long)]
    both: bool,

    /// Reference point as x,y in pixels (repeatable, replaces configured points)
    #[arg(short, long = "point", value_parser = parse_point)]
    points: Vec<Point>,

    /// Warp backend
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Copy the backed up originals over the frames and exit
    #[arg(long)]
    restore: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_point(s: &str) -> Result<Point, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got {:?}", s))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("bad x in {:?}: {}", s, e))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("bad y in {:?}: {}", s, e))?;
    Ok(Point::new(x, y))
}

impl Args {
    /// CLI values take precedence over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.dir {
            config.sequence.directory = dir.clone();
        }
        let reg = &mut config.registration;
        if let Some(reference) = self.reference {
            reg.reference_frame = reference;
        }
        if let Some(start) = self.start {
            reg.start_frame = start;
        }
        if self.end.is_some() {
            reg.end_frame = self.end;
        }
        if self.reverse {
            reg.direction = Direction::Backward;
        } else if self.both {
            reg.direction = Direction::Both;
        }
        if !self.points.is_empty() {
            reg.points = self.points.clone();
        }
        if let Some(backend) = self.backend {
            config.warp.backend = backend;
        }
    }
}

fn default_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging, RUST_LOG takes precedence over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(args.verbose)));
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("driftreg v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_create(&args.config)?;
    args.apply(&mut config);

    let mut sequence = DirectorySequence::open(&config.sequence)
        .with_context(|| format!("Failed to open sequence in {:?}", config.sequence.directory))?;

    if args.restore {
        let restored = sequence.restore_originals()?;
        println!("Restored {} frames", restored);
        return Ok(());
    }

    let mut sequencer = Sequencer::new(&config.tracker, &config.warp);
    let report = sequencer.run_with_report(&mut sequence, &config.registration);

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize run report")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report to {:?}", path))?;
        info!("Wrote run report to {:?}", path);
    }

    if let Some(error) = &report.error {
        bail!("Registration failed: {}", error);
    }

    println!(
        "Registered {} frames ({} unwarped, {} skipped) in {} ms",
        report.registered, report.unwarped, report.skipped, report.elapsed_ms
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("12.5, 40").unwrap(), Point::new(12.5, 40.0));
        assert!(parse_point("12.5").is_err());
        assert!(parse_point("a,1").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "driftreg", "--dir", "frames", "-r", "3", "--end", "9", "--both", "-p", "1,2", "-p", "3,4",
            "--backend", "cpu",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.sequence.directory, PathBuf::from("frames"));
        assert_eq!(config.registration.reference_frame, 3);
        assert_eq!(config.registration.end_frame, Some(9));
        assert_eq!(config.registration.direction, Direction::Both);
        assert_eq!(config.registration.points.len(), 2);
        assert_eq!(config.warp.backend, Backend::Cpu);
    }

    #[test]
    fn test_verbose_lowers_default_level() {
        assert_eq!(default_level(false), "info");
        assert_eq!(default_level(true), "debug");
        assert!(EnvFilter::try_new(default_level(true)).is_ok());
    }

    #[test]
    fn test_reverse_and_both_conflict() {
        assert!(Args::try_parse_from(["driftreg", "--reverse", "--both"]).is_err());
    }
}

//! Toolpath CLI - command-line interface for the toolpath library
//!
//! Usage:
//!   toolpath export --print <print.json> [--config <config.json>] -o <out.gcode>
//!   toolpath retime-fan <in.gcode> -o <out.gcode> --delay 0.5
//!   toolpath bridge-angle --region <region.json> --lower <lower.json> --spacing 0.4
//!   toolpath config --output <config.json>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn, LevelFilter};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use toolpath::bridge::{detect_object_bridges, BridgeDetector};
use toolpath::clipper::total_area;
use toolpath::geometry::ExPolygon;
use toolpath::{export_gcode, FanTimingBuffer, Print, PrintConfig, WarningLevel};

/// Order toolpaths and emit G-code for sliced prints
#[derive(Parser, Debug)]
#[command(name = "toolpath")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export a sliced print (JSON) to G-code
    Export {
        /// Sliced print in JSON format
        #[arg(long, value_name = "PRINT")]
        print: PathBuf,

        /// Print configuration file (JSON format); missing fields take defaults
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Output G-code file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Number of threads for geometry preparation (0 = auto)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Shift fan speed changes earlier in an existing G-code file
    RetimeFan {
        /// Input G-code file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output G-code file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// How far ahead (seconds) fan speed-ups are issued
        #[arg(long)]
        delay: f64,

        /// Split long moves so the command lands on time
        #[arg(long)]
        split: bool,

        /// Full-power spin-up time (seconds) when starting from a stopped fan
        #[arg(long, default_value = "0")]
        kickstart: f64,

        /// Extrusion distances in the file are absolute (M82)
        #[arg(long)]
        absolute_e: bool,
    },

    /// Detect the bridging angle of a region over the layer below
    BridgeAngle {
        /// Region to bridge, JSON list of expolygons
        #[arg(long, value_name = "REGION")]
        region: PathBuf,

        /// Lower layer slices, JSON list of expolygons
        #[arg(long, value_name = "LOWER")]
        lower: PathBuf,

        /// Extrusion spacing in mm
        #[arg(long, default_value = "0.4")]
        spacing: f64,

        /// Use this angle (degrees) instead of searching
        #[arg(long)]
        override_deg: Option<f64>,
    },

    /// Write the default print configuration as JSON
    Config {
        /// Output file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    match cli.command {
        Commands::Export {
            print,
            config,
            output,
            jobs,
        } => cmd_export(print, config, output, jobs),
        Commands::RetimeFan {
            input,
            output,
            delay,
            split,
            kickstart,
            absolute_e,
        } => cmd_retime_fan(input, output, delay, split, kickstart, absolute_e),
        Commands::BridgeAngle {
            region,
            lower,
            spacing,
            override_deg,
        } => cmd_bridge_angle(region, lower, spacing, override_deg),
        Commands::Config { output } => cmd_config(output),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {} file", what))
}

fn cmd_export(
    print_path: PathBuf,
    config_path: Option<PathBuf>,
    output: PathBuf,
    jobs: usize,
) -> Result<()> {
    if jobs > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("Failed to initialize thread pool")?;
    }

    info!("Loading print: {}", print_path.display());
    let print: Print = read_json(&print_path, "print")?;
    let config = match config_path {
        Some(path) => {
            info!("Loading config: {}", path.display());
            read_json::<PrintConfig>(&path, "config")?
        }
        None => PrintConfig::default(),
    };

    // Bridge regions are independent of each other; search them up front.
    let spacing = config.extruder(0).nozzle_diameter;
    for object in &print.objects {
        let bridges = detect_object_bridges(object, spacing);
        let unanchored = bridges.iter().filter(|b| b.direction.is_none()).count();
        info!(
            "{}: {} bridge regions, {} without anchors",
            object.name,
            bridges.len(),
            unanchored
        );
    }

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} layers {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );
    progress.set_message("Generating G-code...");

    let on_layer = |done: usize, total: usize| {
        progress.set_length(total as u64);
        progress.set_position(done as u64);
    };
    let report = export_gcode(&print, &config, &output, Some(&on_layer), None)
        .context("G-code export failed")?;
    progress.finish_with_message("Done!");

    for warning in &report.warnings {
        match warning.level {
            WarningLevel::Critical => warn!("critical: {}", warning.message),
            WarningLevel::NonCritical => warn!("{}", warning.message),
        }
    }

    println!();
    println!("Export complete!");
    println!("  Output: {}", output.display());
    println!("  Layers: {}", report.layer_count);
    println!("  Tool changes: {}", report.toolchanges);
    println!(
        "  Filament used: {:.2} m",
        report.total_filament_mm() / 1000.0
    );
    for (extruder, cm3) in &report.filament_used_cm3 {
        println!("    T{}: {:.2} cm3", extruder, cm3);
    }

    Ok(())
}

/// Lines handed to the fan buffer per call.
const RETIME_BLOCK_LINES: usize = 1024;

fn cmd_retime_fan(
    input: PathBuf,
    output: PathBuf,
    delay: f64,
    split: bool,
    kickstart: f64,
    absolute_e: bool,
) -> Result<()> {
    if delay < 0.0 {
        bail!("--delay must not be negative");
    }
    let reader = BufReader::new(
        fs::File::open(&input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        fs::File::create(&output)
            .with_context(|| format!("Failed to create {}", output.display()))?,
    );

    let mut buffer = FanTimingBuffer::new(delay, !absolute_e)
        .split_moves(split)
        .kickstart(kickstart);

    let mut block = String::new();
    let mut lines_in_block = 0;
    let mut total_lines = 0usize;
    for line in reader.lines() {
        let line = line.context("Failed to read G-code")?;
        block.push_str(&line);
        block.push('\n');
        lines_in_block += 1;
        total_lines += 1;
        if lines_in_block == RETIME_BLOCK_LINES {
            writer.write_all(buffer.process(&block, false).as_bytes())?;
            block.clear();
            lines_in_block = 0;
        }
    }
    writer.write_all(buffer.process(&block, true).as_bytes())?;
    writer.flush().context("Failed to write output")?;

    info!("Retimed {} lines with a {:.2}s fan delay", total_lines, delay);
    println!("Wrote {}", output.display());
    Ok(())
}

fn cmd_bridge_angle(
    region: PathBuf,
    lower: PathBuf,
    spacing: f64,
    override_deg: Option<f64>,
) -> Result<()> {
    let region: Vec<ExPolygon> = read_json(&region, "region")?;
    let lower: Vec<ExPolygon> = read_json(&lower, "lower layer")?;
    if spacing <= 0.0 {
        bail!("--spacing must be positive");
    }

    let mut detector = BridgeDetector::new_multi(region, &lower, spacing);
    match detector.detect_angle(override_deg.map(f64::to_radians)) {
        Some(direction) => {
            let covered = detector.coverage(direction.angle, false);
            let unsupported = detector.unsupported_edges(direction.angle);
            println!("Angle: {:.2}°", direction.angle.to_degrees());
            println!("  Score: {:.3}", direction.coverage);
            println!("  Anchored lines: {}", direction.nb_lines_anchored);
            println!("  Covered area: {:.2} mm²", total_area(&covered));
            println!("  Unsupported edges: {}", unsupported.len());
        }
        None => {
            println!("No bridging angle: the region has no anchors below.");
        }
    }
    Ok(())
}

fn cmd_config(output: PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&PrintConfig::default())
        .context("Failed to serialize config")?;
    fs::write(&output, json).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

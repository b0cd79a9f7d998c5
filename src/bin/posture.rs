//! Posture CLI - offline tools for Posture Guard
//!
//! Commands:
//! - evaluate: Run recorded frames through the frame pipeline
//! - calibrate: Capture a baseline from a recorded frame
//! - clear: Discard the stored baseline
//! - sensitivity: Store a sensitivity percentage
//! - status: Show the persisted calibration state
//! - doctor: Diagnose configuration and storage
//! - thresholds: Print the sensitivity to angle threshold table

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use posture_guard::config::{MAX_SENSITIVITY, MIN_SENSITIVITY};
use posture_guard::logging::{init_tracing, LogConfig};
use posture_guard::storage::{JsonFileStorage, KeyValueStorage};
use posture_guard::store::{PersistedPosture, STORAGE_KEY};
use posture_guard::types::{Evaluation, PostureStatus};
use posture_guard::{
    angle_threshold_deg, BaselineMetrics, FrameProcessor, FrameRecord, PostureConfig,
    PostureError, PostureStore, FRAME_SCHEMA_VERSION, PRODUCER_NAME, VERSION,
};

/// Posture - offline tools for the posture monitoring pipeline
#[derive(Parser)]
#[command(name = "posture")]
#[command(version = VERSION)]
#[command(about = "Evaluate recorded pose landmarks and manage calibration", long_about = None)]
struct Cli {
    /// Storage file holding the persisted calibration
    #[arg(long, global = true, default_value = "posture-storage.json")]
    storage: PathBuf,

    /// Pipeline configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recorded frames through the frame pipeline
    Evaluate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Emit every raw evaluation instead of only published statuses
        #[arg(long)]
        raw: bool,

        /// Override the stored sensitivity for this run only
        #[arg(long)]
        sensitivity: Option<u8>,
    },

    /// Capture a baseline from a recorded frame and store it
    Calibrate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Frame to use (defaults to the last frame with a usable pose)
        #[arg(long)]
        frame: Option<usize>,
    },

    /// Discard the stored baseline
    Clear,

    /// Store a sensitivity percentage
    Sensitivity {
        /// Percentage, clamped to the supported range
        percent: u8,
    },

    /// Show the persisted calibration state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and storage
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the sensitivity to angle threshold table
    Thresholds {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one frame per line)
    Ndjson,
    /// JSON array of frames
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one status per line)
    Ndjson,
    /// JSON array of statuses
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        log_level: cli.log_level.clone(),
        json: cli.log_json,
    });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PostureCliError> {
    let config = match &cli.config {
        Some(path) => PostureConfig::load(path)?,
        None => PostureConfig::default(),
    };

    match cli.command {
        Commands::Evaluate {
            input,
            input_format,
            output_format,
            raw,
            sensitivity,
        } => cmd_evaluate(
            &cli.storage,
            &config,
            &input,
            input_format,
            output_format,
            raw,
            sensitivity,
        ),

        Commands::Calibrate {
            input,
            input_format,
            frame,
        } => cmd_calibrate(&cli.storage, &config, &input, input_format, frame),

        Commands::Clear => {
            let store = open_store(&cli.storage);
            store.clear_calibration();
            store.flush()?;
            println!("Calibration cleared");
            Ok(())
        }

        Commands::Sensitivity { percent } => {
            let store = open_store(&cli.storage);
            let stored = store.set_sensitivity(percent);
            store.flush()?;
            println!(
                "Sensitivity set to {}% (angle threshold {:.1}°)",
                stored,
                angle_threshold_deg(stored)
            );
            Ok(())
        }

        Commands::Status { json } => cmd_status(&cli.storage, json),

        Commands::Doctor { json } => cmd_doctor(&cli.storage, cli.config.as_deref(), json),

        Commands::Thresholds { json } => cmd_thresholds(json),
    }
}

fn open_store(storage: &Path) -> PostureStore {
    PostureStore::with_storage(Arc::new(JsonFileStorage::new(storage)))
}

fn read_frames(input: &Path, format: InputFormat) -> Result<Vec<FrameRecord>, PostureCliError> {
    let data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let frames = match format {
        InputFormat::Ndjson => FrameRecord::parse_ndjson(&data)?,
        InputFormat::Json => FrameRecord::parse_array(&data)?,
    };
    if frames.is_empty() {
        return Err(PostureCliError::NoFrames);
    }

    let failures = FrameRecord::validate_batch(&frames);
    if let Some(first) = failures.first() {
        eprintln!(
            "frame {} (index {}): {}",
            first.frame_id.as_deref().unwrap_or("unknown"),
            first.index,
            first.error
        );
        return Err(PostureCliError::ValidationFailed(failures.len()));
    }
    Ok(frames)
}

/// One line of `evaluate` output
#[derive(Serialize)]
struct EvaluationRecord<'a> {
    frame_id: Option<&'a str>,
    captured_at: String,
    timestamp_ms: f64,
    status: PostureStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    evaluation: Option<&'a Evaluation>,
}

fn cmd_evaluate(
    storage: &Path,
    config: &PostureConfig,
    input: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    raw: bool,
    sensitivity: Option<u8>,
) -> Result<(), PostureCliError> {
    let frames = read_frames(input, input_format)?;

    // Work on an in-memory copy so a sensitivity override is never persisted
    let persisted = PersistedPosture::load(&JsonFileStorage::new(storage));
    let store = PostureStore::new();
    if let Some(baseline) = persisted.baseline_metrics {
        store.complete_calibration(baseline);
    }
    store.set_sensitivity(sensitivity.unwrap_or(persisted.sensitivity_percentage));
    store.begin_detection();

    let mut processor = FrameProcessor::new(config);
    let mut lines: Vec<serde_json::Value> = Vec::new();

    for frame in &frames {
        let landmarks = frame.landmark_set()?;
        let published = processor.process(&store, landmarks, frame.timestamp_ms);

        let status = match (raw, published) {
            (true, _) => processor.last_evaluation().map(|e| e.status.clone()),
            (false, published) => published,
        };
        if let Some(status) = status {
            let record = EvaluationRecord {
                frame_id: frame.frame_id.as_deref(),
                captured_at: frame.captured_at.to_rfc3339(),
                timestamp_ms: frame.timestamp_ms,
                status,
                evaluation: if raw { processor.last_evaluation() } else { None },
            };
            lines.push(serde_json::to_value(&record)?);
        }
    }

    print!("{}", format_output(&lines, &output_format)?);
    Ok(())
}

fn cmd_calibrate(
    storage: &Path,
    config: &PostureConfig,
    input: &Path,
    input_format: InputFormat,
    frame: Option<usize>,
) -> Result<(), PostureCliError> {
    let frames = read_frames(input, input_format)?;
    let cutoff = config.visibility_cutoff;

    let baseline = match frame {
        Some(index) => {
            let record = frames
                .get(index)
                .ok_or(PostureCliError::FrameIndex(index, frames.len()))?;
            record
                .landmark_set()?
                .and_then(|set| BaselineMetrics::from_landmarks(&set, cutoff))
                .ok_or(PostureCliError::NoUsableFrame)?
        }
        None => frames
            .iter()
            .rev()
            .filter_map(|record| record.landmark_set().ok().flatten())
            .find_map(|set| BaselineMetrics::from_landmarks(&set, cutoff))
            .ok_or(PostureCliError::NoUsableFrame)?,
    };

    let store = open_store(storage);
    store.complete_calibration(baseline);
    store.flush()?;
    println!("{}", serde_json::to_string_pretty(&baseline)?);
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    #[serde(flatten)]
    persisted: PersistedPosture,
    angle_threshold_deg: f32,
}

fn cmd_status(storage: &Path, json: bool) -> Result<(), PostureCliError> {
    let persisted = PersistedPosture::load(&JsonFileStorage::new(storage));
    let report = StatusReport {
        angle_threshold_deg: angle_threshold_deg(persisted.sensitivity_percentage),
        persisted,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Posture Status");
        println!("==============");
        println!("Storage:     {}", storage.display());
        println!("Calibrated:  {}", report.persisted.is_calibrated);
        println!(
            "Sensitivity: {}% (threshold {:.1}°)",
            report.persisted.sensitivity_percentage, report.angle_threshold_deg
        );
        if let Some(baseline) = report.persisted.baseline_metrics {
            println!(
                "Baseline:    nose ({:.3}, {:.3}), ear-shoulder {:.3}",
                baseline.nose_x, baseline.nose_y, baseline.ear_shoulder_distance
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

fn check(name: &str, status: CheckStatus, message: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        status,
        message: message.into(),
    }
}

fn cmd_doctor(storage: &Path, config: Option<&Path>, json: bool) -> Result<(), PostureCliError> {
    let mut checks = vec![
        check("version", CheckStatus::Ok, format!("posture-guard {}", VERSION)),
        check(
            "frame_schema",
            CheckStatus::Ok,
            format!("Input schema: {}", FRAME_SCHEMA_VERSION),
        ),
    ];

    checks.push(match config {
        None => check("config", CheckStatus::Ok, "Using built-in defaults"),
        Some(path) => match PostureConfig::load(path) {
            Ok(config) => check(
                "config",
                CheckStatus::Ok,
                format!(
                    "Config valid (poll every {}ms, countdown {}s)",
                    config.poll_interval_ms, config.calibration.countdown_from
                ),
            ),
            Err(e) => check("config", CheckStatus::Error, e.to_string()),
        },
    });

    checks.push(if !storage.exists() {
        check(
            "storage",
            CheckStatus::Warning,
            "Storage file does not exist yet (not calibrated)",
        )
    } else {
        match JsonFileStorage::new(storage).get(STORAGE_KEY) {
            Ok(Some(json)) => match PersistedPosture::from_json(&json) {
                Ok(persisted) => check(
                    "storage",
                    CheckStatus::Ok,
                    format!(
                        "Storage valid (calibrated: {}, sensitivity {}%)",
                        persisted.is_calibrated, persisted.sensitivity_percentage
                    ),
                ),
                Err(e) => check(
                    "storage",
                    CheckStatus::Error,
                    format!("Invalid persisted state: {}", e),
                ),
            },
            Ok(None) => check("storage", CheckStatus::Warning, "No persisted posture state"),
            Err(e) => check("storage", CheckStatus::Error, e.to_string()),
        }
    });

    checks.push(if atty::is(atty::Stream::Stdin) {
        check("stdin", CheckStatus::Ok, "stdin is a TTY (interactive mode)")
    } else {
        check("stdin", CheckStatus::Ok, "stdin is a pipe (ready for --input -)")
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Posture Doctor Report");
        println!("=====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", icon, check.name, check.message);
        }
    }

    if report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error))
    {
        Err(PostureCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_thresholds(json: bool) -> Result<(), PostureCliError> {
    let table: Vec<(u8, f32)> = (MIN_SENSITIVITY..=MAX_SENSITIVITY)
        .map(|percent| (percent, angle_threshold_deg(percent)))
        .collect();

    if json {
        let rows: Vec<serde_json::Value> = table
            .iter()
            .map(|(percent, deg)| serde_json::json!({ "sensitivity": percent, "thresholdDeg": deg }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("Sensitivity  Threshold");
        for (percent, deg) in table {
            println!("{:>10}%  {:>8.1}°", percent, deg);
        }
    }
    Ok(())
}

fn format_output(
    records: &[serde_json::Value],
    format: &OutputFormat,
) -> Result<String, PostureCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for record in records {
                lines.push(serde_json::to_string(record)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(records)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(records)?),
    }
}

// Error types

#[derive(Debug)]
enum PostureCliError {
    Io(io::Error),
    Posture(PostureError),
    Json(serde_json::Error),
    NoFrames,
    NoUsableFrame,
    FrameIndex(usize, usize),
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for PostureCliError {
    fn from(e: io::Error) -> Self {
        PostureCliError::Io(e)
    }
}

impl From<PostureError> for PostureCliError {
    fn from(e: PostureError) -> Self {
        PostureCliError::Posture(e)
    }
}

impl From<serde_json::Error> for PostureCliError {
    fn from(e: serde_json::Error) -> Self {
        PostureCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PostureCliError> for CliError {
    fn from(e: PostureCliError) -> Self {
        let (code, message, hint) = match e {
            PostureCliError::Io(e) => ("IO_ERROR", e.to_string(), Some("Check file paths and permissions")),
            PostureCliError::Posture(e) => {
                let hint = match &e {
                    PostureError::InvalidConfig(_) => Some("Run 'posture doctor --config <file>'"),
                    PostureError::Storage(_) | PostureError::Io(_) => {
                        Some("Check that --storage points to a writable file")
                    }
                    PostureError::ParseError(_) | PostureError::InvalidLandmarks(_) => {
                        Some("Ensure input matches the posture.frame.v1 schema")
                    }
                    _ => None,
                };
                ("POSTURE_ERROR", e.to_string(), hint)
            }
            PostureCliError::Json(e) => ("JSON_ERROR", e.to_string(), Some("Check JSON syntax")),
            PostureCliError::NoFrames => (
                "NO_FRAMES",
                "No frames found in input".to_string(),
                Some("Input must contain at least one posture.frame.v1 record"),
            ),
            PostureCliError::NoUsableFrame => (
                "NO_USABLE_FRAME",
                "No frame shows a trackable pose".to_string(),
                Some("The nose and one ear/shoulder pair must be visible"),
            ),
            PostureCliError::FrameIndex(index, len) => (
                "FRAME_INDEX",
                format!("Frame {} requested but input has {} frames", index, len),
                None,
            ),
            PostureCliError::ValidationFailed(count) => (
                "VALIDATION_FAILED",
                format!("{} frame(s) failed validation", count),
                None,
            ),
            PostureCliError::DoctorFailed => (
                "DOCTOR_FAILED",
                "One or more checks failed".to_string(),
                None,
            ),
        };
        CliError {
            code: code.to_string(),
            message,
            hint: hint.map(str::to_string),
        }
    }
}

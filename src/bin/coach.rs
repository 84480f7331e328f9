//! Coach CLI - Command-line interface for Synheart Coach
//!
//! Commands:
//! - run: Replay or stream feature snapshots and emit tick outputs (NDJSON)
//! - classify: Classify a single snapshot with the rule-based classifier
//! - doctor: Diagnose configuration and credentials
//! - schema: Print the snapshot and tick output schemas

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use synheart_coach::aggregator::snapshot_channel;
use synheart_coach::remote::{EnvKeyProvider, KeyProvider, Secret, StaticKeyProvider, StaticTransport};
use synheart_coach::{
    ChildProfile, CoachError, CoachingSession, EngineConfig, EngineMode, FeatureSnapshot,
    ReplaySource, RuleClassifier, SessionAggregate, SignalAggregator, SignalInputs, TickOutput, TickSink, COACH_VERSION,
    PRODUCER_NAME,
};

/// Coach - On-device arousal decision engine for caregiving sessions
#[derive(Parser)]
#[command(name = "coach")]
#[command(author = "Synheart AI Inc")]
#[command(version = COACH_VERSION)]
#[command(about = "Classify arousal and generate coaching guidance from feature snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process NDJSON feature snapshots into NDJSON tick outputs
    Run {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Engine configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Child profile JSON file
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Force personalized mode
        #[arg(long)]
        personalized: bool,

        /// Serve every remote call from this canned provider response (dry run)
        #[arg(long)]
        static_verdict: Option<PathBuf>,

        /// Input lines are raw extractor outputs, aggregated into snapshots
        #[arg(long)]
        inputs: bool,

        /// Treat stdin as a live feed: unconsumed snapshots are dropped
        #[arg(long)]
        live: bool,

        /// Space replayed ticks one tick interval apart
        #[arg(long)]
        paced: bool,

        /// Flush output after each record
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Classify a single snapshot (rule-based, no network)
    Classify {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Engine configuration JSON file (thresholds)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and credentials
    Doctor {
        /// Engine configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Feature snapshot (one per line)
    Input,
    /// Tick output (one per line)
    Output,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays NDJSON
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synheart_coach=info,coach=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), CoachCliError> {
    match cli.command {
        Commands::Run {
            input,
            config,
            profile,
            personalized,
            static_verdict,
            inputs,
            live,
            paced,
            flush,
        } => {
            let mut config = load_config(config.as_deref())?;
            if personalized {
                config.mode = EngineMode::Personalized;
            }
            let profile = match profile {
                Some(path) => ChildProfile::from_json(&fs::read_to_string(path)?)?,
                None => ChildProfile::default(),
            };
            let options = RunOptions {
                inputs,
                live,
                paced,
                flush,
                static_verdict,
            };
            cmd_run(&input, config, profile, options)
        }

        Commands::Classify { input, config } => cmd_classify(&input, config.as_deref()),

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),

        Commands::Schema {
            schema_type,
            json_schema,
        } => cmd_schema(schema_type, json_schema),
    }
}

struct RunOptions {
    inputs: bool,
    live: bool,
    paced: bool,
    flush: bool,
    static_verdict: Option<PathBuf>,
}

fn cmd_run(
    input: &Path,
    config: EngineConfig,
    profile: ChildProfile,
    options: RunOptions,
) -> Result<(), CoachCliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    let mut session = CoachingSession::new(config.clone(), profile)?;
    if config.mode == EngineMode::Personalized {
        let Some(verdict_path) = options.static_verdict.as_deref() else {
            return Err(CoachCliError::MissingTransport);
        };
        let transport = Arc::new(StaticTransport::new(fs::read_to_string(verdict_path)?));
        let keys = StaticKeyProvider::new().with_key(config.provider.id, Secret::new("dry-run"));
        session = session.with_transport(transport, Arc::new(keys));
    }

    let mut sink = NdjsonSink::new(options.flush);

    if options.live && is_stdin(input) {
        let (publisher, receiver) = snapshot_channel();
        let mut aggregator = options.inputs.then(|| SignalAggregator::from_config(&config));
        // Reader thread owns the publisher; end of input closes the channel
        let reader = std::thread::spawn(move || -> Result<u64, CoachCliError> {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let snapshot = match aggregator.as_mut() {
                    Some(aggregator) => aggregator.aggregate(serde_json::from_str::<SignalInputs>(trimmed)?).snapshot,
                    None => FeatureSnapshot::from_json(trimmed)?,
                };
                if !publisher.push(snapshot) {
                    break;
                }
            }
            Ok(publisher.dropped())
        });

        runtime.block_on(session.run(receiver, &mut sink, CancellationToken::new()))?;
        let dropped = reader
            .join()
            .map_err(|_| CoachCliError::Runtime("stdin reader panicked".to_string()))??;
        if dropped > 0 {
            tracing::warn!(dropped, "snapshots dropped before they could be processed");
        }
    } else {
        let raw = read_input(input)?;
        let mut source = if options.inputs {
            ReplaySource::from_signal_ndjson(&raw, &mut SignalAggregator::from_config(&config))?
        } else {
            ReplaySource::from_ndjson(&raw)?
        };
        if source.is_empty() {
            return Err(CoachCliError::NoSnapshots);
        }
        runtime.block_on(session.run_source(&mut source, &mut sink, options.paced))?;
    }

    sink.finish()
}

fn cmd_classify(input: &Path, config: Option<&Path>) -> Result<(), CoachCliError> {
    let config = load_config(config)?;
    let snapshot = FeatureSnapshot::from_json(read_input(input)?.trim())?;
    let decision = RuleClassifier::new(config.thresholds).classify(&snapshot);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn cmd_doctor(config_path: Option<&Path>, json: bool) -> Result<(), CoachCliError> {
    let mut checks = Vec::new();

    let config = match config_path {
        Some(path) => match fs::read_to_string(path)
            .map_err(|e| CoachError::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))
            .and_then(|s| EngineConfig::from_json(&s))
        {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Configuration is valid ({:?} mode)", config.mode),
                });
                Some(config)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                });
                None
            }
        },
        None => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: "No config file given, using defaults".to_string(),
            });
            Some(EngineConfig::default())
        }
    };

    if let Some(config) = &config {
        let provider = config.provider.id;
        let var = EnvKeyProvider::var_name(provider);
        let check = match (EnvKeyProvider.get(provider).is_some(), config.mode) {
            (true, _) => DoctorCheck {
                name: "credentials".to_string(),
                status: CheckStatus::Ok,
                message: format!("{} is set", var),
            },
            (false, EngineMode::Personalized) => DoctorCheck {
                name: "credentials".to_string(),
                status: CheckStatus::Warning,
                message: format!("{} is not set; every tick will use the rule-based decision", var),
            },
            (false, EngineMode::Standard) => DoctorCheck {
                name: "credentials".to_string(),
                status: CheckStatus::Ok,
                message: "Standard mode makes no remote calls".to_string(),
            },
        };
        checks.push(check);

        checks.push(DoctorCheck {
            name: "timing".to_string(),
            status: if config.remote_timeout_ms > config.tick_interval_ms {
                CheckStatus::Warning
            } else {
                CheckStatus::Ok
            },
            message: format!(
                "tick {} ms, remote timeout {} ms, cache TTL {} ms",
                config.tick_interval_ms, config.remote_timeout_ms, config.cache_ttl_ms
            ),
        });
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: COACH_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Coach Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(CoachCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), CoachCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", input_json_schema());
            } else {
                println!("Input: feature snapshot (one JSON object per line)");
                println!();
                println!("- tick: monotonically increasing integer");
                println!("- captured_at: RFC 3339 timestamp");
                println!("- movement_intensity: 0-1");
                println!("- tension_score: 0-1 (optional)");
                println!("- behaviors: meltdown, self_injury, aggression, elopement, screaming,");
                println!("  crying, pacing, covering_ears, averting_gaze, hand_flapping, rocking, spinning");
                println!("- vocal_stress: flat | neutral | elevated | strained (optional)");
                println!("- environment: {{ lighting, noise_level, cluttered, crowded }} (optional)");
                println!("- caregiver_stress: low | moderate | high (optional, dual-signal only)");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", output_json_schema());
            } else {
                println!("Output: one record per line, tagged by \"type\"");
                println!();
                println!("tick:");
                println!("- decision: {{ band, confidence, source, rationale, key_indicators, tick, timestamp }}");
                println!("  band: shutdown | calm | building | high | crisis");
                println!("- suggestions: [{{ id, severity, category, text }}] (at most max_suggestions)");
                println!("- fallback: unavailable | timeout | malformed | abandoned | cancelled (optional)");
                println!("- event: persistent_remote_failure (optional)");
                println!();
                println!("summary:");
                println!("- session_id, started_at, decisions_published, remote_decisions");
                println!("- band_counts, behaviors_observed, suggestion_counts");
            }
        }
    }

    Ok(())
}

// Helper functions

fn is_stdin(path: &Path) -> bool {
    path.to_string_lossy() == "-"
}

fn read_input(input: &Path) -> Result<String, CoachCliError> {
    if is_stdin(input) {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, CoachCliError> {
    match path {
        Some(path) => Ok(EngineConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Tick(&'a TickOutput),
    Summary(&'a SessionAggregate),
}

/// Writes tick outputs and summaries to stdout as NDJSON
struct NdjsonSink {
    stdout: io::Stdout,
    flush: bool,
    error: Option<CoachCliError>,
}

impl NdjsonSink {
    fn new(flush: bool) -> Self {
        Self {
            stdout: io::stdout(),
            flush,
            error: None,
        }
    }

    fn write(&mut self, record: Record<'_>) {
        if self.error.is_some() {
            return;
        }
        let result = serde_json::to_string(&record)
            .map_err(CoachCliError::from)
            .and_then(|line| {
                let mut out = self.stdout.lock();
                writeln!(out, "{}", line)?;
                if self.flush {
                    out.flush()?;
                }
                Ok(())
            });
        if let Err(e) = result {
            self.error = Some(e);
        }
    }

    fn finish(mut self) -> Result<(), CoachCliError> {
        self.stdout.flush()?;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl TickSink for NdjsonSink {
    fn publish(&mut self, output: &TickOutput) {
        self.write(Record::Tick(output));
    }

    fn publish_summary(&mut self, summary: &SessionAggregate) {
        self.write(Record::Summary(summary));
    }
}

fn input_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://synheart.ai/schemas/coach.feature_snapshot.v1.json",
        "title": "coach.feature_snapshot.v1",
        "description": "One tick of aggregated caregiving-session features",
        "type": "object",
        "required": ["tick", "captured_at", "movement_intensity"],
        "properties": {
            "tick": { "type": "integer", "minimum": 0 },
            "captured_at": { "type": "string", "format": "date-time" },
            "movement_intensity": { "type": "number", "minimum": 0, "maximum": 1 },
            "tension_score": { "type": "number", "minimum": 0, "maximum": 1 },
            "behaviors": {
                "type": "array",
                "items": {
                    "type": "string",
                    "enum": [
                        "meltdown", "self_injury", "aggression", "elopement", "screaming", "crying",
                        "pacing", "covering_ears", "averting_gaze", "hand_flapping", "rocking", "spinning"
                    ]
                }
            },
            "vocal_stress": { "type": "string", "enum": ["flat", "neutral", "elevated", "strained"] },
            "environment": {
                "type": "object",
                "properties": {
                    "lighting": { "type": "string", "enum": ["dim", "normal", "bright", "flickering"] },
                    "noise_level": { "type": "string", "enum": ["quiet", "moderate", "loud"] },
                    "cluttered": { "type": "boolean" },
                    "crowded": { "type": "boolean" }
                }
            },
            "caregiver_stress": { "type": "string", "enum": ["low", "moderate", "high"] }
        }
    })
    .to_string()
}

fn output_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://synheart.ai/schemas/coach.tick_output.v1.json",
        "title": "coach.tick_output.v1",
        "description": "Published decision and coaching for one tick",
        "type": "object",
        "required": ["type", "tick", "decision", "suggestions"],
        "properties": {
            "type": { "type": "string", "const": "tick" },
            "tick": { "type": "integer" },
            "decision": {
                "type": "object",
                "required": ["band", "confidence", "source", "rationale", "key_indicators", "tick", "timestamp"],
                "properties": {
                    "band": { "type": "string", "enum": ["shutdown", "calm", "building", "high", "crisis"] },
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                    "source": { "type": "string", "enum": ["rule", "remote"] },
                    "rationale": { "type": "string" },
                    "key_indicators": { "type": "array", "items": { "type": "string" } },
                    "tick": { "type": "integer" },
                    "timestamp": { "type": "string", "format": "date-time" }
                }
            },
            "suggestions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "severity": { "type": "string", "enum": ["low", "medium", "high"] },
                        "category": { "type": "string", "enum": ["safety", "sensory", "relational"] },
                        "text": { "type": "string" }
                    }
                }
            },
            "fallback": {
                "type": "string",
                "enum": ["unavailable", "timeout", "malformed", "abandoned", "cancelled"]
            },
            "event": { "type": "object" }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum CoachCliError {
    Io(io::Error),
    Coach(CoachError),
    Json(serde_json::Error),
    Runtime(String),
    NoSnapshots,
    MissingTransport,
    DoctorFailed,
}

impl From<io::Error> for CoachCliError {
    fn from(e: io::Error) -> Self {
        CoachCliError::Io(e)
    }
}

impl From<CoachError> for CoachCliError {
    fn from(e: CoachError) -> Self {
        CoachCliError::Coach(e)
    }
}

impl From<serde_json::Error> for CoachCliError {
    fn from(e: serde_json::Error) -> Self {
        CoachCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<CoachCliError> for CliError {
    fn from(e: CoachCliError) -> Self {
        match e {
            CoachCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            CoachCliError::Coach(CoachError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'coach doctor --config <file>' for details".to_string()),
            },
            CoachCliError::Coach(e) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'coach schema input' to see the snapshot format".to_string()),
            },
            CoachCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            CoachCliError::Runtime(msg) => CliError {
                code: "RUNTIME_ERROR".to_string(),
                message: msg,
                hint: None,
            },
            CoachCliError::NoSnapshots => CliError {
                code: "NO_SNAPSHOTS".to_string(),
                message: "No snapshots found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            CoachCliError::MissingTransport => CliError {
                code: "NO_TRANSPORT".to_string(),
                message: "Personalized mode needs a transport; the CLI bundles no HTTP client".to_string(),
                hint: Some("Pass --static-verdict <file> for a dry run, or use standard mode".to_string()),
            },
            CoachCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

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
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

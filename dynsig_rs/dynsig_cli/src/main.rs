use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use dynsig::{
    compute_beta_curve, compute_signals, parse_timestamp, read_curve_text, reconstruct_basal,
    split_range, to_percent, write_curve_text, ActionCurveStore, ConvolutionMode, CurveCategory,
    CurveRecord, CurveRepository, DerivedSignalRow, DsError, EngineConfig, GridTick, MealCode,
    MemoryStore, OverrideCommand, RawInput, ScheduledRateEntry, SignalSink, TICKS_PER_HOUR,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Basal reconstruction and dynamic insulin/carb signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconstruct the actual basal rate over a tick range
    Basal(BasalArgs),
    /// Compute derived signal rows (basal, dynamic insulin, dynamic carbs)
    Signals(SignalsArgs),
    /// Curate a curve from a one-value-per-line text file
    CurveImport(CurveImportArgs),
    /// Write the latest curve of a category as one integer per line
    CurveExport(CurveExportArgs),
    /// Generate a beta-shaped curve
    CurveBeta(CurveBetaArgs),
    /// Summarize the latest curve of every category
    CurveStats(CurveStatsArgs),
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Basal(args) => args.verbose,
            Command::Signals(args) => args.verbose,
            Command::CurveImport(args) => args.verbose,
            Command::CurveExport(args) => args.verbose,
            Command::CurveBeta(args) => args.verbose,
            Command::CurveStats(args) => args.verbose,
        }
    }
}

#[derive(Args, Debug)]
struct EventFiles {
    /// Basal schedules CSV: effective_at, then one rate or 24 hourly rates
    #[arg(long, value_hint = ValueHint::FilePath)]
    schedules: PathBuf,

    /// Override commands CSV: at, kind, ratio, duration_minutes
    #[arg(long, value_hint = ValueHint::FilePath)]
    commands: Option<PathBuf>,

    /// Bolus and carb inputs CSV: at, kind, amount, meal
    #[arg(long, value_hint = ValueHint::FilePath)]
    inputs: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TickRange {
    /// First tick (inclusive), e.g. `2024-06-15 00:00`
    #[arg(long, value_parser = parse_time_arg)]
    start: NaiveDateTime,

    /// End of range (exclusive)
    #[arg(long, value_parser = parse_time_arg)]
    end: NaiveDateTime,
}

impl TickRange {
    fn ticks(&self) -> (GridTick, GridTick) {
        (GridTick::floor(self.start), GridTick::ceil(self.end))
    }
}

#[derive(Parser, Debug)]
struct BasalArgs {
    #[command(flatten)]
    events: EventFiles,

    #[command(flatten)]
    range: TickRange,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "basal.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct SignalsArgs {
    #[command(flatten)]
    events: EventFiles,

    #[command(flatten)]
    range: TickRange,

    /// Curve records JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: PathBuf,

    /// Engine configuration JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Convolution mode (overrides the config file)
    #[arg(long, value_enum)]
    mode: Option<ModeOpt>,

    /// Hours per independently computed chunk (0 = one chunk)
    #[arg(long, default_value_t = 24)]
    chunk_hours: usize,

    /// What to do when a chunk fails
    #[arg(long, value_enum, default_value_t = OnErrorOpt::Halt)]
    on_error: OnErrorOpt,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "signals.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CurveImportArgs {
    /// Plain-text curve, one weight per line
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    #[arg(long, value_enum)]
    category: CategoryOpt,

    /// Curve records JSON to append to (created if missing)
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: PathBuf,

    /// Leading lines to skip
    #[arg(long, default_value_t = 0)]
    skip_lines: usize,

    #[arg(long, default_value = "")]
    notes: String,

    /// Curation time (defaults to now)
    #[arg(long, value_parser = parse_time_arg)]
    curated_at: Option<NaiveDateTime>,

    /// Engine configuration JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CurveExportArgs {
    #[arg(long, value_enum)]
    category: CategoryOpt,

    /// Curve records JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: PathBuf,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CurveBetaArgs {
    /// Rising shape parameter
    #[arg(long)]
    a: f64,

    /// Falling shape parameter
    #[arg(long)]
    b: f64,

    /// Number of 5-minute ticks
    #[arg(long)]
    length: usize,

    #[arg(long, value_enum)]
    category: CategoryOpt,

    /// Curve records JSON to curate into; without it the curve is printed
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: Option<PathBuf>,

    #[arg(long, default_value = "")]
    notes: String,

    /// Engine configuration JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CurveStatsArgs {
    /// Curve records JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    curves: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CategoryOpt {
    Insulin,
    Rescue,
    Brunch,
    Dinner,
}

impl From<CategoryOpt> for CurveCategory {
    fn from(value: CategoryOpt) -> Self {
        match value {
            CategoryOpt::Insulin => CurveCategory::Insulin,
            CategoryOpt::Rescue => CurveCategory::Rescue,
            CategoryOpt::Brunch => CurveCategory::Brunch,
            CategoryOpt::Dinner => CurveCategory::Dinner,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeOpt {
    Batch,
    Incremental,
}

impl From<ModeOpt> for ConvolutionMode {
    fn from(value: ModeOpt) -> Self {
        match value {
            ModeOpt::Batch => ConvolutionMode::Batch,
            ModeOpt::Incremental => ConvolutionMode::Incremental,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OnErrorOpt {
    /// Log the failed chunk and keep going
    Skip,
    /// Stop at the first failed chunk, keeping rows already computed
    Halt,
}

fn parse_time_arg(token: &str) -> std::result::Result<NaiveDateTime, String> {
    parse_timestamp(token).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.command.verbose() {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Basal(args) => handle_basal(args),
        Command::Signals(args) => handle_signals(args),
        Command::CurveImport(args) => handle_curve_import(args),
        Command::CurveExport(args) => handle_curve_export(args),
        Command::CurveBeta(args) => handle_curve_beta(args),
        Command::CurveStats(args) => handle_curve_stats(args),
    }
}

fn handle_basal(args: BasalArgs) -> Result<()> {
    let events = load_events(&args.events)?;
    let (start, end) = args.range.ticks();
    let samples = reconstruct_basal(&events, start, end)
        .with_context(|| format!("failed to reconstruct basal {} .. {}", start, end))?;
    info!("Reconstructed {} basal ticks from {} to {}", samples.len(), start, end);

    write_rows(&args.output, |writer| {
        writer.write_record([
            "tick",
            "programmed_rate",
            "factor",
            "actual_rate",
            "units",
            "notes",
        ])?;
        for sample in &samples {
            writer.write_record([
                sample.tick.to_string(),
                format!("{:.3}", sample.programmed_rate),
                format!("{:.3}", sample.factor),
                format!("{:.3}", sample.actual_rate),
                format!("{:.5}", sample.units),
                sample.notes.clone(),
            ])?;
        }
        Ok(())
    })?;
    info!("Wrote basal CSV: {}", args.output.display());
    Ok(())
}

fn handle_signals(args: SignalsArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    let events = load_events(&args.events)?;
    let mut curve_store =
        ActionCurveStore::new(load_curve_store(&args.curves)?, config.tolerance.clone());
    let curves = curve_store
        .load_all()
        .with_context(|| format!("failed to load curves from {}", args.curves.display()))?;
    for category in CurveCategory::ALL {
        if let Some(record) = curve_store.repository().latest_curve(category)? {
            let fingerprint = record.fingerprint();
            info!("Using {} curve {}", category, &fingerprint[..12]);
        }
    }

    let (start, end) = args.range.ticks();
    let ranges = if args.chunk_hours == 0 {
        vec![(start, end)]
    } else {
        split_range(start, end, args.chunk_hours * TICKS_PER_HOUR as usize)?
    };

    let t_compute = Instant::now();
    let results: Vec<(GridTick, GridTick, std::result::Result<Vec<DerivedSignalRow>, DsError>)> =
        ranges
            .par_iter()
            .map(|(s, e)| (*s, *e, compute_signals(&events, &curves, *s, *e, &config)))
            .collect();
    debug!(
        "Compute stage: {:.1} ms ({} chunks)",
        t_compute.elapsed().as_secs_f64() * 1000.0,
        results.len()
    );

    let mut sink = MemoryStore::new();
    let mut skipped = 0usize;
    let mut halted = None;
    for (s, e, result) in results {
        match result {
            Ok(rows) => sink
                .upsert_signals(&rows)
                .with_context(|| format!("failed to store {} .. {}", s, e))?,
            Err(err) if args.on_error == OnErrorOpt::Skip => {
                warn!("Skipping {} .. {}: {}", s, e, err);
                skipped += 1;
            }
            Err(err) => {
                halted = Some(anyhow!(err).context(format!("failed to compute {} .. {}", s, e)));
                break;
            }
        }
    }

    write_rows(&args.output, |writer| {
        writer.write_record([
            "tick",
            "actual_basal_rate",
            "basal_units",
            "dynamic_insulin",
            "dynamic_carbs",
            "notes",
        ])?;
        for row in sink.signals() {
            writer.write_record([
                row.tick.to_string(),
                format!("{:.3}", row.actual_basal_rate),
                format!("{:.5}", row.basal_units),
                format!("{:.5}", row.dynamic_insulin),
                format!("{:.5}", row.dynamic_carbs),
                row.notes.clone(),
            ])?;
        }
        Ok(())
    })?;
    info!(
        "Wrote {} signal rows to {} ({} chunks skipped)",
        sink.signals().count(),
        args.output.display(),
        skipped
    );

    match halted {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn handle_curve_import(args: CurveImportArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let file = File::open(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let weights = read_curve_text(file, args.skip_lines, &config.tolerance)
        .with_context(|| format!("failed to parse {}", args.input.display()))?;
    let curated_at = args
        .curated_at
        .unwrap_or_else(|| Local::now().naive_local());
    let record = CurveRecord::curate(
        args.category.into(),
        curated_at,
        &weights,
        args.notes,
        &config,
    )?;
    curate_into(&args.curves, record, &config)
}

fn handle_curve_export(args: CurveExportArgs) -> Result<()> {
    let category: CurveCategory = args.category.into();
    let repository = load_curve_store(&args.curves)?;
    let record = repository
        .latest_curve(category)?
        .ok_or(DsError::MissingCurve(category))?;
    let config = EngineConfig::default();
    let weights = to_percent(&record.weights, &config.tolerance)?;
    if args.output.as_os_str() == "-" {
        write_curve_text(io::stdout().lock(), &weights, &config.tolerance)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_curve_text(file, &weights, &config.tolerance)?;
        info!(
            "Wrote {} curve ({} ticks): {}",
            category,
            weights.len(),
            args.output.display()
        );
    }
    Ok(())
}

fn handle_curve_beta(args: CurveBetaArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let weights = compute_beta_curve(args.a, args.b, args.length, &config.tolerance)?;
    match &args.curves {
        Some(path) => {
            let notes = if args.notes.is_empty() {
                format!("beta a={} b={} length={}", args.a, args.b, args.length)
            } else {
                args.notes.clone()
            };
            let record = CurveRecord::curate(
                args.category.into(),
                Local::now().naive_local(),
                &weights,
                notes,
                &config,
            )?;
            curate_into(path, record, &config)
        }
        None => {
            write_curve_text(io::stdout().lock(), &weights, &config.tolerance)?;
            Ok(())
        }
    }
}

fn handle_curve_stats(args: CurveStatsArgs) -> Result<()> {
    let repository = load_curve_store(&args.curves)?;
    let mut store = ActionCurveStore::new(repository, EngineConfig::default().tolerance);
    let mut rows = Vec::new();
    for category in CurveCategory::ALL {
        match store.load(category) {
            Ok(curve) => {
                let fingerprint = store
                    .repository()
                    .latest_curve(category)?
                    .map(|r| r.fingerprint())
                    .unwrap_or_default();
                rows.push((category, curve.len(), curve.stats(), fingerprint));
            }
            Err(DsError::MissingCurve(_)) => warn!("No {} curve in {}", category, args.curves.display()),
            Err(err) => return Err(err.into()),
        }
    }

    write_rows(&args.output, |writer| {
        writer.write_record([
            "category",
            "ticks",
            "peak",
            "peak_minutes",
            "duration_minutes",
            "fingerprint",
        ])?;
        for (category, len, stats, fingerprint) in &rows {
            writer.write_record([
                category.to_string(),
                len.to_string(),
                format!("{:.5}", stats.peak),
                stats.peak_offset_minutes.to_string(),
                stats.duration_minutes.to_string(),
                fingerprint.clone(),
            ])?;
        }
        Ok(())
    })
}

fn curate_into(path: &Path, record: CurveRecord, config: &EngineConfig) -> Result<()> {
    let repository = if path.exists() {
        load_curve_store(path)?
    } else {
        MemoryStore::new()
    };
    let mut store = ActionCurveStore::new(repository, config.tolerance.clone());
    let category = record.category;
    let ticks = record.weights.len();
    let fingerprint = record.fingerprint();
    store.curate(record)?;
    let repository = store.into_repository();
    let text = serde_json::to_string_pretty(repository.curves())?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        "Curated {} curve ({} ticks, {}) into {}",
        category,
        ticks,
        &fingerprint[..12],
        path.display()
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(config)
}

fn load_curve_store(path: &Path) -> Result<MemoryStore> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read curves {}", path.display()))?;
    let records: Vec<CurveRecord> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a curve record array", path.display()))?;
    let mut store = MemoryStore::new();
    for record in records {
        store.insert_curve(record)?;
    }
    debug!("Loaded {} curve records from {}", store.curves().len(), path.display());
    Ok(store)
}

fn load_events(files: &EventFiles) -> Result<MemoryStore> {
    let mut store = MemoryStore::new();
    let schedules = read_csv_rows(&files.schedules, |record| {
        let at = time_field(record, 0)?;
        let rates = record
            .iter()
            .skip(1)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| f.parse::<f64>().map_err(|_| anyhow!("invalid rate '{}'", f)))
            .collect::<Result<Vec<_>>>()?;
        let entry = match rates.len() {
            1 => ScheduledRateEntry::flat(at, rates[0]),
            24 => {
                let mut table = [0.0; 24];
                table.copy_from_slice(&rates);
                ScheduledRateEntry::new(at, table)
            }
            n => return Err(anyhow!("expected 1 or 24 rates, found {}", n)),
        };
        store.insert_schedule(entry);
        Ok(())
    })?;

    let mut commands = 0;
    if let Some(path) = &files.commands {
        commands = read_csv_rows(path, |record| {
            let command = OverrideCommand::from_parts(
                time_field(record, 0)?,
                record.get(1).unwrap_or(""),
                optional_field(record, 2)?,
                optional_field(record, 3)?,
            )?;
            store.insert_override(command);
            Ok(())
        })?;
    }

    let mut inputs = 0;
    if let Some(path) = &files.inputs {
        inputs = read_csv_rows(path, |record| {
            let at = time_field(record, 0)?;
            let amount: f64 = optional_field(record, 2)?.unwrap_or(0.0);
            let input = match record.get(1).map(|k| k.trim().to_ascii_lowercase()).as_deref() {
                Some("bolus") => RawInput::bolus(at, amount),
                Some("carbs") => RawInput::carbs(at, amount, optional_field::<MealCode>(record, 3)?),
                other => return Err(anyhow!("unknown input kind {:?}", other)),
            };
            store.insert_input(input);
            Ok(())
        })?;
    }
    info!(
        "Loaded {} schedules, {} override commands, {} inputs",
        schedules, commands, inputs
    );
    Ok(store)
}

fn read_csv_rows<F>(path: &Path, mut on_row: F) -> Result<usize>
where
    F: FnMut(&csv::StringRecord) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut count = 0;
    for (index, record) in reader.records().enumerate() {
        // Line numbers count the header.
        let line = index + 2;
        let record = record.with_context(|| format!("{}:{}: malformed row", path.display(), line))?;
        on_row(&record).with_context(|| format!("{}:{}", path.display(), line))?;
        count += 1;
    }
    Ok(count)
}

fn time_field(record: &csv::StringRecord, index: usize) -> Result<NaiveDateTime> {
    let token = record
        .get(index)
        .ok_or_else(|| anyhow!("missing timestamp column {}", index))?;
    Ok(parse_timestamp(token)?)
}

fn optional_field<T>(record: &csv::StringRecord, index: usize) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match record.get(index).map(str::trim) {
        None | Some("") => Ok(None),
        Some(token) => token
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid value '{}' in column {}: {}", token, index, e)),
    }
}

fn write_rows<F>(output: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<Box<dyn Write>>) -> Result<()>,
{
    let sink: Box<dyn Write> = if output.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(output)
                .with_context(|| format!("failed to create {}", output.display()))?,
        )
    };
    let mut writer = csv::Writer::from_writer(sink);
    write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

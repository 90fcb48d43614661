//! CAN Log Analyzer CLI Application
//!
//! This is the command-line front end for the can-log-analyzer library.
//! It adds:
//! - Request assembly from arguments and an optional config.toml
//! - Progress output on stderr
//! - Text and JSON reports
//! - Timeline range and zoom queries

use anyhow::{bail, Context, Result};
use can_log_analyzer::{AnalysisKind, AnalysisRequest, Analyzer, CancelToken, Progress, RawFile, Stage};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

mod config;
mod report;

use config::{AppConfig, OutputFormat};

/// CAN Log Analyzer - Detect faults and traffic patterns in vehicle bus logs
#[derive(Parser, Debug)]
#[command(name = "can-log-cli")]
#[command(about = "Analyze CAN/LIN/UDS log files (ASC, BLF, TRC, candump, CSV, XML)", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the selected analyses and print a report
    Analyze {
        /// Log files to analyze (added to the files listed in the config)
        files: Vec<PathBuf>,

        /// DBC file with signal definitions
        #[arg(long, value_name = "FILE")]
        dbc: Option<PathBuf>,

        /// Analyses to run, comma separated (errors, patterns, signals, timeline, correlation)
        #[arg(short, long, value_delimiter = ',')]
        analyses: Vec<AnalysisKind>,

        /// Write the full session as JSON to this file ("-" for stdout)
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,

        /// Maximum number of error events listed in the text report
        #[arg(long, value_name = "COUNT")]
        max_errors: Option<usize>,
    },

    /// Print the detected format of each file
    Detect {
        files: Vec<PathBuf>,
    },

    /// Query the merged timeline of one or more files
    Timeline {
        files: Vec<PathBuf>,

        /// DBC file with signal definitions
        #[arg(long, value_name = "FILE")]
        dbc: Option<PathBuf>,

        /// Start of the range in seconds (default: first entry)
        #[arg(long)]
        from: Option<f64>,

        /// End of the range in seconds (default: last entry)
        #[arg(long)]
        to: Option<f64>,

        /// Down-sample the range into this many buckets instead of listing entries
        #[arg(long, value_name = "COUNT")]
        zoom: Option<usize>,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Log Analyzer CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using analyzer library v{}", can_log_analyzer::VERSION);

    let app_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    match &args.command {
        Command::Analyze {
            files,
            dbc,
            analyses,
            json,
            max_errors,
        } => run_analyze(&app_config, files, dbc.as_deref(), analyses, json.as_deref(), *max_errors, args.quiet),
        Command::Detect { files } => run_detect(&app_config, files),
        Command::Timeline {
            files,
            dbc,
            from,
            to,
            zoom,
        } => run_timeline(&app_config, files, dbc.as_deref(), *from, *to, *zoom, args.quiet),
    }
}

/// Build a request from the config's `[input]` section plus command-line overrides
fn build_request(
    app_config: &AppConfig,
    files: &[PathBuf],
    dbc: Option<&Path>,
    analyses: &[AnalysisKind],
) -> Result<AnalysisRequest> {
    let paths: Vec<&PathBuf> = app_config.input.files.iter().chain(files).collect();
    if paths.is_empty() {
        bail!("No input files given (pass files as arguments or list them under [input] in the config)");
    }

    let raw_files = paths
        .into_iter()
        .map(|path| RawFile::from_path(path).with_context(|| format!("Failed to open {:?}", path)))
        .collect::<Result<Vec<_>>>()?;
    let mut request = AnalysisRequest::new(raw_files);

    if let Some(dbc) = dbc.or(app_config.input.dbc.as_deref()) {
        let dbc = RawFile::from_path(dbc).with_context(|| format!("Failed to open DBC {:?}", dbc))?;
        request = request.with_dbc(dbc);
    }

    let selected = if analyses.is_empty() {
        &app_config.input.analyses[..]
    } else {
        analyses
    };
    if !selected.is_empty() {
        request = request.with_analyses(selected.iter().copied());
    }
    Ok(request)
}

/// Progress reporting on stderr, one line per stage change and per 10% of a file
fn progress_printer(quiet: bool) -> impl Fn(Progress) + Send + Sync {
    move |progress: Progress| {
        if quiet {
            return;
        }
        match (progress.stage, progress.file_id) {
            (Stage::Parsing, Some(file_id)) => {
                log::debug!("file {}: {:.0}%", file_id, progress.percent);
            }
            (Stage::Detecting, _) => {}
            (stage, _) => eprintln!("  {} ...", stage),
        }
    }
}

fn run_analyze(
    app_config: &AppConfig,
    files: &[PathBuf],
    dbc: Option<&Path>,
    analyses: &[AnalysisKind],
    json: Option<&Path>,
    max_errors: Option<usize>,
    quiet: bool,
) -> Result<()> {
    let request = build_request(app_config, files, dbc, analyses)?;
    let analyzer = Analyzer::new(app_config.analysis.clone())?;
    let session = analyzer
        .run(&request, &progress_printer(quiet), &CancelToken::new())
        .context("Analysis failed")?;

    if let Some(path) = json {
        write_report_to(path, |out| report::write_json(&session, out))?;
        if path != Path::new("-") {
            log::info!("Session written to {:?}", path);
        }
    }

    let output = &app_config.output;
    let max_errors = max_errors.unwrap_or(output.max_errors);
    let target = output.path.as_deref().unwrap_or(Path::new("-"));
    match output.format {
        OutputFormat::Json if json.is_none() => write_report_to(target, |out| report::write_json(&session, out))?,
        OutputFormat::Json => {}
        OutputFormat::Text if quiet => {}
        OutputFormat::Text => write_report_to(target, |out| report::write_text(&session, out, max_errors))?,
    }

    let failed = session.files.iter().filter(|f| !f.is_completed()).count();
    if failed > 0 {
        log::warn!("{} of {} file(s) could not be analyzed", failed, session.files.len());
    }
    Ok(())
}

fn run_detect(app_config: &AppConfig, files: &[PathBuf]) -> Result<()> {
    let analyzer = Analyzer::new(app_config.analysis.clone())?;
    let paths: Vec<&PathBuf> = app_config.input.files.iter().chain(files).collect();
    if paths.is_empty() {
        bail!("No input files given");
    }

    for path in paths {
        let file = RawFile::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
        let tag = analyzer.detect(&file)?;
        println!("{:<10} {}", tag.as_str(), path.display());
    }
    Ok(())
}

fn run_timeline(
    app_config: &AppConfig,
    files: &[PathBuf],
    dbc: Option<&Path>,
    from: Option<f64>,
    to: Option<f64>,
    zoom: Option<usize>,
    quiet: bool,
) -> Result<()> {
    let request = build_request(app_config, files, dbc, &[AnalysisKind::Errors, AnalysisKind::Timeline])?;
    let analyzer = Analyzer::new(app_config.analysis.clone())?;
    let session = analyzer
        .run(&request, &progress_printer(quiet), &CancelToken::new())
        .context("Analysis failed")?;

    let Some(timeline) = session.timeline.as_ref() else {
        bail!("No timeline was built");
    };
    let Some((first, last)) = timeline.time_range() else {
        println!("Timeline is empty");
        return Ok(());
    };
    let t0 = from.unwrap_or(first);
    let t1 = to.unwrap_or(last);
    if t1 < t0 {
        bail!("--to ({}) is before --from ({})", t1, t0);
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match zoom {
        Some(buckets) => report::write_zoom(&mut out, &timeline.zoom(t0, t1, Some(buckets)))?,
        None => report::write_events(&mut out, timeline, t0, t1)?,
    }
    out.flush()?;
    Ok(())
}

/// Run `write` against `path`, or stdout when the path is "-"
fn write_report_to(path: &Path, write: impl FnOnce(&mut dyn Write) -> Result<()>) -> Result<()> {
    if path == Path::new("-") {
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        write(&mut out)?;
        out.flush()?;
    } else {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut out = BufWriter::new(file);
        write(&mut out)?;
        out.flush()?;
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args()))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_analyze() {
        let args = Args::try_parse_from([
            "can-log-cli",
            "-vv",
            "analyze",
            "trace.asc",
            "bus.log",
            "--dbc",
            "powertrain.dbc",
            "--analyses",
            "errors,timeline",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Analyze { files, dbc, analyses, .. } => {
                assert_eq!(files.len(), 2);
                assert_eq!(dbc, Some(PathBuf::from("powertrain.dbc")));
                assert_eq!(analyses, vec![AnalysisKind::Errors, AnalysisKind::Timeline]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_args_reject_unknown_analysis() {
        assert!(Args::try_parse_from(["can-log-cli", "analyze", "a.asc", "--analyses", "magic"]).is_err());
    }

    #[test]
    fn test_build_request_merges_config_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let listed = dir.path().join("listed.asc");
        let extra = dir.path().join("extra.log");
        std::fs::write(&listed, "date Mon Jan 1 10:00:00 2024\n").unwrap();
        std::fs::write(&extra, "(0.0) can0 100#01\n").unwrap();

        let mut app_config = AppConfig::default();
        app_config.input.files = vec![listed];
        app_config.input.analyses = vec![AnalysisKind::Patterns];

        let request = build_request(&app_config, &[extra.clone()], None, &[]).unwrap();
        assert_eq!(request.files.len(), 2);
        assert_eq!(request.files[1].name(), "extra.log");
        assert_eq!(request.analyses.len(), 1);

        let request = build_request(&app_config, &[extra], None, &[AnalysisKind::Errors]).unwrap();
        assert!(request.analyses.contains(&AnalysisKind::Errors));
        assert!(!request.analyses.contains(&AnalysisKind::Patterns));

        assert!(build_request(&AppConfig::default(), &[], None, &[]).is_err());
    }
}

//! Offload - Command-line front end for the media transfer engine.
//!
//! Copies photos and videos from a memory card (or any directory given with
//! `--src`) into an organized destination, verifying every copy. Progress
//! goes to stderr, plan previews to stdout.

mod logging;

use chrono::NaiveDate;
use clap::Parser;
use offload_engine::{
    filter, CancelToken, ChecksumAlgorithm, CleanupConfirmation, EngineConfig, ErrorKind, Filter,
    ItemId, MediaType, MountDirProbe, OrganizationMode, PlanAction, ProgressCallback,
    RecordStatus, SelectionSet, SystemProbe, TransferPlan, TransferRecord, TransferReport,
    TransferSession, VolumeHandle, VolumeProbe, VolumeWatcher,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Offload - Copy media off a memory card, organized and verified
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version = "0.1.0")]
#[command(about = "Copy photos and videos from a removable volume with verification")]
struct Args {
    /// Source volume root (default: first detected removable volume)
    #[arg(long, value_name = "PATH")]
    src: Option<PathBuf>,

    /// Destination directory (default: `destination` from the config file)
    #[arg(long, value_name = "PATH")]
    dst: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Folder layout: by-date or by-template
    #[arg(long, value_name = "MODE")]
    mode: Option<String>,

    /// Date folder pattern, e.g. YYYY/MM or YYYY/YYYY-MM-DD
    #[arg(long, value_name = "PATTERN")]
    date_format: Option<String>,

    /// Template fields, one folder level each (e.g. make,model)
    #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
    template: Vec<String>,

    /// File name prefix
    #[arg(long, value_name = "TEXT")]
    rename_base: Option<String>,

    /// First sequence number
    #[arg(long, value_name = "N")]
    start_index: Option<u64>,

    /// Zero-padded width of the sequence number
    #[arg(long, value_name = "N")]
    digits: Option<u32>,

    /// Checksum algorithm for verification: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Only items captured on or after this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    from: Option<String>,

    /// Only items captured on or before this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    to: Option<String>,

    /// Media types to transfer (photo,video,other)
    #[arg(long, value_name = "TYPES", value_delimiter = ',')]
    types: Vec<String>,

    /// Print the plan without copying anything
    #[arg(long)]
    dry_run: bool,

    /// Delete originals that were copied and verified
    #[arg(long)]
    delete_originals: bool,

    /// Confirm deletion of originals
    #[arg(long)]
    yes: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug)]
struct ProgressState {
    copied: u64,
    last_draw: Option<Instant>,
}

/// CLI implementation of ProgressCallback for displaying transfer progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    total_bytes: u64,
    state: Mutex<ProgressState>,
}

impl CliProgress {
    fn new(verbose: bool, total_bytes: u64) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            total_bytes,
            state: Mutex::new(ProgressState {
                copied: 0,
                last_draw: None,
            }),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!(
            "[{}{}] {}%",
            "=".repeat(filled),
            " ".repeat(empty),
            percent
        )
    }

    fn file_name(path: &Path) -> &str {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("(unknown)")
    }
}

impl ProgressCallback for CliProgress {
    fn on_session_started(&self, total_items: usize, total_bytes: u64) {
        eprintln!(
            "Transferring {} across {} items",
            Self::format_bytes(total_bytes),
            total_items
        );
    }

    fn on_record_updated(&self, index: usize, record: &TransferRecord) {
        if !self.verbose || !record.status.is_terminal() {
            return;
        }
        eprintln!(
            "\n[{:3}] {}: {} -> {}",
            index,
            record.status,
            Self::file_name(&record.source_path),
            record.destination_path.display()
        );
    }

    fn on_bytes_copied(&self, _index: usize, _item_id: ItemId, delta: u64) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.copied += delta;

        // Throttle progress updates to avoid spam (max once per 200ms)
        if let Some(last) = state.last_draw {
            if last.elapsed().as_millis() < 200 {
                return;
            }
        }
        state.last_draw = Some(Instant::now());

        let total_bytes = self.total_bytes.max(1);
        let percent = (state.copied as f64 / total_bytes as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{}",
            Self::print_progress_bar(percent),
            Self::format_bytes(state.copied),
            Self::format_bytes(total_bytes)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_retry_scheduled(&self, _index: usize, record: &TransferRecord, attempt: u32, kind: ErrorKind) {
        eprintln!(
            "\nRetrying {} after attempt {} ({})",
            Self::file_name(&record.source_path),
            attempt,
            kind
        );
    }

    fn on_session_completed(&self, report: &TransferReport) {
        eprintln!();
        if report.cancelled {
            eprintln!("Transfer cancelled.");
        } else {
            eprintln!("Transfer complete!");
        }

        eprintln!(
            "Summary: {} succeeded, {} skipped, {} failed",
            report.count(RecordStatus::Succeeded),
            report.count(RecordStatus::Skipped),
            report.count(RecordStatus::Failed)
        );
        if report.total_retries() > 0 {
            eprintln!("Retries: {}", report.total_retries());
        }
        eprintln!("Bytes copied: {}", Self::format_bytes(report.bytes_copied()));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if let Some(err) = &report.session_error {
            eprintln!();
            eprintln!("Session aborted: {}", err);
        }

        if report.failed().next().is_some() {
            eprintln!();
            eprintln!("Failed files:");
            for record in report.failed() {
                match &record.error_message {
                    Some(msg) => eprintln!("  {}: {}", Self::file_name(&record.source_path), msg),
                    None => eprintln!("  {}: (unknown error)", Self::file_name(&record.source_path)),
                }
            }
        }
    }
}

/// Parse and validate command-line arguments, then run the transfer
fn main() {
    let args = Args::parse();
    logging::init_logger(args.verbose);

    // Exit code tracking
    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<(), String> {
    if args.delete_originals && !args.yes && !args.dry_run {
        return Err("Refusing to delete originals without --yes".to_string());
    }

    let config = build_config(args)?;
    let destination = args
        .dst
        .clone()
        .or_else(|| config.destination.clone())
        .ok_or_else(|| "No destination: pass --dst or set `destination` in the config".to_string())?;
    let filters = build_filters(args)?;
    let volume = select_volume(args)?;

    eprintln!("Source: {}", volume.root().display());
    eprintln!("Destination: {}", destination.display());

    let mut session = TransferSession::new(volume, destination, config)
        .map_err(|e| format!("Session setup failed: {}", e))?;

    let catalog = session.scan().map_err(|e| format!("Scan failed: {}", e))?;
    for warning in catalog.warnings() {
        eprintln!("Warning: skipped {}: {}", warning.path.display(), warning.message);
    }
    let selection = SelectionSet::from_items(filter(catalog.items(), &filters));
    eprintln!("Found {} media files, {} selected", catalog.len(), selection.len());
    if selection.is_empty() {
        return Ok(());
    }

    let plan = session
        .preview(&selection)
        .map_err(|e| format!("Planning failed: {}", e))?;

    if args.dry_run {
        print_plan(&plan, session.volume().root());
        return Ok(());
    }

    let progress = CliProgress::new(args.verbose, plan.total_bytes());
    let report = session
        .run(&plan, &CancelToken::new(), &progress)
        .map_err(|e| format!("Transfer failed: {}", e))?;

    let mut cleanup_failures = 0;
    if args.delete_originals {
        let result = session
            .cleanup(&report, CleanupConfirmation::Confirmed)
            .map_err(|e| format!("Cleanup failed: {}", e))?;
        eprintln!(
            "Originals deleted: {}, kept: {}, deletion failures: {}",
            result.deleted_count(),
            result.kept,
            result.failed_count()
        );
        for failure in &result.failures {
            eprintln!("  {}: {}", failure.path.display(), failure.message);
        }
        cleanup_failures = result.failed_count();
    }

    if let Some(err) = &report.session_error {
        Err(format!("Transfer aborted: {}", err))
    } else if report.count(RecordStatus::Failed) > 0 {
        Err("One or more files failed to transfer".to_string())
    } else if cleanup_failures > 0 {
        Err("One or more originals could not be deleted".to_string())
    } else {
        Ok(())
    }
}

/// Configuration file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };

    let policy = &mut config.organization;
    if let Some(mode) = &args.mode {
        policy.mode = match mode.to_lowercase().as_str() {
            "by-date" | "date" => OrganizationMode::ByDate,
            "by-template" | "by-metadata-template" | "template" => {
                OrganizationMode::ByMetadataTemplate
            }
            _ => {
                return Err(format!(
                    "Invalid mode '{}'. Must be 'by-date' or 'by-template'",
                    mode
                ))
            }
        };
    }
    if let Some(date_format) = &args.date_format {
        policy.date_format = date_format.clone();
    }
    if !args.template.is_empty() {
        policy.template = args.template.iter().map(|t| t.trim().to_string()).collect();
    }
    if let Some(base) = &args.rename_base {
        policy.rename_base = base.clone();
    }
    if let Some(start) = args.start_index {
        policy.rename_start_index = start;
    }
    if let Some(digits) = args.digits {
        policy.rename_digits = digits;
    }

    if let Some(hash) = &args.hash {
        config.transfer.checksum = hash.parse::<ChecksumAlgorithm>().map_err(|_| {
            format!(
                "Invalid hash algorithm '{}'. Must be 'crc32', 'md5', 'sha256', or 'blake3'",
                hash
            )
        })?;
    }

    if !args.types.is_empty() {
        config.catalog.media_types = args
            .types
            .iter()
            .map(|t| t.parse::<MediaType>().map_err(|e| e.to_string()))
            .collect::<Result<_, _>>()?;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}'. Expected YYYY-MM-DD", value))
}

fn build_filters(args: &Args) -> Result<Vec<Filter>, String> {
    let from = args.from.as_deref().map(parse_date).transpose()?;
    let to = args.to.as_deref().map(parse_date).transpose()?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(format!("--from {} is after --to {}", from, to));
        }
    }

    let mut filters = Vec::new();
    if from.is_some() || to.is_some() {
        filters.push(Filter::DateRange { from, to });
    }
    Ok(filters)
}

/// The explicit `--src`, or the first removable volume the OS reports.
fn select_volume(args: &Args) -> Result<VolumeHandle, String> {
    if let Some(src) = &args.src {
        if !src.exists() {
            return Err(format!("Source directory does not exist: {}", src.display()));
        }
        if !src.is_dir() {
            return Err(format!("Source is not a directory: {}", src.display()));
        }
        return Ok(VolumeHandle::for_directory(src));
    }

    detect_volume(SystemProbe)
        .or_else(|| detect_volume(MountDirProbe::platform_default()))
        .ok_or_else(|| "No removable volume detected; pass --src".to_string())
}

fn detect_volume<P: VolumeProbe>(probe: P) -> Option<VolumeHandle> {
    let mut watcher = VolumeWatcher::new(probe);
    watcher.poll().ok()?;
    watcher.active()
}

fn print_plan(plan: &TransferPlan, source_root: &Path) {
    for entry in &plan.entries {
        let source = entry.source_path.strip_prefix(source_root).unwrap_or(&entry.source_path);
        let action = match entry.action {
            PlanAction::Copy => "copy",
            PlanAction::SkipIdentical => "skip",
        };
        println!("{:4} {} -> {}", action, source.display(), entry.destination_path.display());
    }
    println!(
        "{} to copy ({}), {} already present",
        plan.copy_count(),
        CliProgress::format_bytes(plan.total_bytes()),
        plan.skip_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn args(src: &Path, dst: &Path) -> Args {
        Args {
            src: Some(src.to_path_buf()),
            dst: Some(dst.to_path_buf()),
            config: None,
            mode: None,
            date_format: None,
            template: Vec::new(),
            rename_base: None,
            start_index: None,
            digits: None,
            hash: None,
            from: None,
            to: None,
            types: Vec::new(),
            dry_run: false,
            delete_originals: false,
            yes: false,
            verbose: false,
        }
    }

    fn card(dir: &Path) {
        let dcim = dir.join("DCIM/100CANON");
        std::fs::create_dir_all(&dcim).expect("Failed to create dir");
        for (name, day) in [("IMG_0001.JPG", 15), ("MVI_0002.MOV", 16)] {
            let path = dcim.join(name);
            std::fs::write(&path, name.as_bytes()).expect("Failed to write file");
            let when = NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
                .and_local_timezone(Local)
                .unwrap();
            filetime::set_file_mtime(
                &path,
                filetime::FileTime::from_system_time(SystemTime::from(when)),
            )
            .expect("Failed to set mtime");
        }
    }

    #[test]
    fn test_cli_transfers_card() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());

        let result = run_cli(&args(src_dir.path(), dst_dir.path()));
        assert!(result.is_ok(), "CLI should succeed: {:?}", result);
        assert!(dst_dir.path().join("2024/03/IMG0001.JPG").exists());
        assert!(dst_dir.path().join("2024/03/IMG0002.MOV").exists());
        assert!(src_dir.path().join("DCIM/100CANON/IMG_0001.JPG").exists());
    }

    #[test]
    fn test_cli_dry_run_writes_nothing() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());

        let mut args = args(src_dir.path(), dst_dir.path());
        args.dry_run = true;
        assert!(run_cli(&args).is_ok());
        assert!(!dst_dir.path().join("2024").exists());
    }

    #[test]
    fn test_cli_delete_originals_requires_yes() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());

        let mut args = args(src_dir.path(), dst_dir.path());
        args.delete_originals = true;
        assert!(run_cli(&args).is_err(), "CLI should refuse deletion without --yes");
        assert!(!dst_dir.path().join("2024").exists());

        args.yes = true;
        assert!(run_cli(&args).is_ok());
        assert!(dst_dir.path().join("2024/03/IMG0001.JPG").exists());
        assert!(!src_dir.path().join("DCIM/100CANON/IMG_0001.JPG").exists());
    }

    #[test]
    fn test_cli_template_mode_and_type_filter() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());

        let mut args = args(src_dir.path(), dst_dir.path());
        args.mode = Some("by-template".to_string());
        args.template = vec!["make".to_string(), "type".to_string()];
        args.rename_base = Some("DSC".to_string());
        args.digits = Some(3);
        args.types = vec!["video".to_string()];
        args.hash = Some("md5".to_string());

        assert!(run_cli(&args).is_ok());
        assert!(dst_dir.path().join("unknown/video/DSC001.MOV").exists());
        assert!(!dst_dir.path().join("unknown/photo").exists());
    }

    #[test]
    fn test_cli_date_range() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());

        let mut args = args(src_dir.path(), dst_dir.path());
        args.from = Some("2024-03-16".to_string());
        args.date_format = Some("YYYY-MM-DD".to_string());

        assert!(run_cli(&args).is_ok());
        assert!(dst_dir.path().join("2024-03-16/IMG0001.MOV").exists());
        assert!(!dst_dir.path().join("2024-03-15").exists());
    }

    #[test]
    fn test_cli_reads_config_file() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        card(src_dir.path());
        let config_path = dst_dir.path().join("offload.toml");
        std::fs::write(
            &config_path,
            format!(
                "destination = {:?}\n[organization]\ndate_format = \"YYYY\"\nrename_base = \"CARD\"\n",
                dst_dir.path().join("out").to_string_lossy()
            ),
        )
        .expect("Failed to write config");

        let mut args = args(src_dir.path(), dst_dir.path());
        args.dst = None;
        args.config = Some(config_path);

        assert!(run_cli(&args).is_ok());
        assert!(dst_dir.path().join("out/2024/CARD0001.JPG").exists());
    }

    #[test]
    fn test_cli_rejects_missing_source() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let args = args(Path::new("/nonexistent/path"), dst_dir.path());
        assert!(run_cli(&args).is_err(), "CLI should reject missing source");
    }

    #[test]
    fn test_cli_rejects_invalid_mode() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args(src_dir.path(), dst_dir.path());
        args.mode = Some("invalid".to_string());
        assert!(run_cli(&args).is_err(), "CLI should reject invalid mode");
    }

    #[test]
    fn test_cli_rejects_invalid_hash_algorithm() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args(src_dir.path(), dst_dir.path());
        args.hash = Some("invalid_algo".to_string());
        assert!(run_cli(&args).is_err(), "CLI should reject invalid hash algorithm");
    }

    #[test]
    fn test_cli_rejects_bad_dates() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args(src_dir.path(), dst_dir.path());
        args.from = Some("15/03/2024".to_string());
        assert!(run_cli(&args).is_err());

        args.from = Some("2024-03-20".to_string());
        args.to = Some("2024-03-01".to_string());
        assert!(run_cli(&args).is_err());
    }

    #[test]
    fn test_cli_rejects_zero_digits() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let mut args = args(src_dir.path(), dst_dir.path());
        args.digits = Some(0);
        assert!(run_cli(&args).is_err());
    }

    #[test]
    fn test_progress_formatting() {
        assert_eq!(CliProgress::format_bytes(512), "512.00 B");
        assert_eq!(CliProgress::format_bytes(1536), "1.50 KB");
        assert_eq!(
            CliProgress::format_duration(std::time::Duration::from_secs(3725)),
            "1h 2m 5s"
        );
        assert_eq!(CliProgress::print_progress_bar(50), "[==========          ] 50%");
    }
}

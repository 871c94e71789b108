//! CourseSync - Command-line interface for the course sync engine.
//!
//! A thin front end for manual use and scripting. Progress goes to stderr,
//! command output (course lists, reports, stats) goes to stdout.

use clap::{Parser, Subcommand};
use coursesync::{
    AuthError, CourseRef, CourseUpdate, Credential, DownloadError, FsPortal, PortalError,
    PortalSession, ProgressEvent, ProgressSink, RemoteFile, RemoteRef, RemoteStream, Session,
    SessionState, SyncConfig, SyncEngine, SyncPhase, SyncReport, SyncStatus,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// CourseSync - Mirror course portal files into a local folder
#[derive(Parser, Debug)]
#[command(name = "coursesync")]
#[command(version = "0.1.0")]
#[command(about = "Download new course materials and keep a local mirror up to date")]
struct Args {
    /// Configuration file (TOML); defaults apply when it does not exist
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Root directory of a file-based portal
    #[arg(long, value_name = "DIR", global = true)]
    portal: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync
    Sync,

    /// List known courses
    Courses {
        /// Fetch the course list from the portal first
        #[arg(long)]
        refresh: bool,
    },

    /// Change a course's alias, tabs, or enabled flag
    Course {
        /// Course id as shown by `courses`
        id: String,

        /// Folder name to use instead of the portal's course name
        #[arg(long, value_name = "NAME", conflicts_with = "clear_alias")]
        alias: Option<String>,

        /// Go back to the portal's course name
        #[arg(long)]
        clear_alias: bool,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,

        /// Comma-separated tabs to sync; an empty value selects none
        #[arg(long, value_name = "TABS", value_delimiter = ',')]
        tabs: Option<Vec<String>>,
    },

    /// List past syncs, newest first
    Reports {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Print one sync report as JSON
    Report {
        sync_id: String,
    },

    /// Count files placed locally per course
    Stats,
}

/// Stands in for the portal when none is configured; every call fails.
struct NoPortal;

impl NoPortal {
    const MESSAGE: &'static str = "no portal configured (use --portal)";
}

impl PortalSession for NoPortal {
    fn authenticate(&self, _credential: &Credential) -> Result<SessionState, AuthError> {
        Err(AuthError::NetworkFailure {
            message: Self::MESSAGE.to_string(),
        })
    }

    fn session(&self) -> Session {
        Session::logged_out()
    }

    fn list_courses(&self) -> Result<Vec<CourseRef>, PortalError> {
        Err(PortalError::NetworkFailure {
            message: Self::MESSAGE.to_string(),
        })
    }

    fn list_files(&self, _course_id: &str, _tab: &str) -> Result<Vec<RemoteFile>, PortalError> {
        Err(PortalError::NetworkFailure {
            message: Self::MESSAGE.to_string(),
        })
    }

    fn fetch(&self, _remote_ref: &RemoteRef) -> Result<RemoteStream, DownloadError> {
        Err(DownloadError::NetworkFailure {
            message: Self::MESSAGE.to_string(),
        })
    }

    fn logout(&self) {}
}

/// CLI implementation of ProgressSink for displaying sync progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_phase: Mutex<Option<SyncPhase>>,
    last_progress_update: Mutex<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_phase: Mutex::new(None),
            last_progress_update: Mutex::new(now),
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

    fn format_duration(elapsed: Duration) -> String {
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

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent.min(100))
    }

    /// True when a byte-progress line may be drawn now (max once per 200ms).
    fn should_redraw(&self) -> bool {
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if last.elapsed() < Duration::from_millis(200) {
            return false;
        }
        *last = Instant::now();
        true
    }

    fn print_phase(&self, event: &ProgressEvent) {
        match (event.phase, event.current_course_name.as_deref()) {
            (SyncPhase::Enumerating, Some(course)) => eprintln!(
                "[{}/{}] Listing {}",
                event.current_course_index, event.total_courses, course
            ),
            (SyncPhase::Downloading, _) => eprintln!("Waiting for downloads to finish..."),
            (SyncPhase::Diffing, _) | (SyncPhase::Idle, _) => {}
            (phase, _) => eprintln!("{}...", capitalize(phase.as_str())),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl ProgressSink for CliProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let phase_changed = {
            let mut last = self.last_phase.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *last != Some(event.phase) || event.phase == SyncPhase::Enumerating;
            *last = Some(event.phase);
            changed
        };
        if phase_changed && event.current_file_name.is_none() {
            self.print_phase(&event);
            return;
        }

        let Some(name) = event.current_file_name.as_deref() else {
            return;
        };
        if self.verbose && event.current_file_downloaded == 0 {
            eprintln!("Starting: {}", name);
            return;
        }
        if !self.should_redraw() {
            return;
        }

        let line = match event.current_file_size {
            Some(size) if size > 0 => {
                let percent = (event.current_file_downloaded as f64 / size as f64 * 100.0) as u32;
                format!(
                    "{} {} | {}/{}",
                    Self::progress_bar(percent),
                    name,
                    Self::format_bytes(event.current_file_downloaded),
                    Self::format_bytes(size)
                )
            }
            _ => format!("{} | {}", name, Self::format_bytes(event.current_file_downloaded)),
        };
        eprint!(
            "\r{} | {} done, {} skipped, {} failed   ",
            line, event.stats.downloaded, event.stats.skipped, event.stats.failed
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_report(&self, report: &SyncReport) {
        eprintln!();
        eprintln!("Sync {} finished: {}", report.sync_id, report.status);
        eprintln!(
            "Summary: {} downloaded, {} skipped, {} failed",
            report.summary.downloaded, report.summary.skipped, report.summary.failed
        );
        let bytes: u64 = report.files.downloaded.iter().filter_map(|f| f.size).sum();
        eprintln!("Bytes downloaded: {}", Self::format_bytes(bytes));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if self.verbose {
            for file in &report.files.downloaded {
                eprintln!("  + {} / {}", file.course, file.name);
            }
        }

        if !report.files.failed.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for file in &report.files.failed {
                eprintln!(
                    "  {} / {}: {}",
                    file.course,
                    file.name,
                    file.message.as_deref().unwrap_or("(unknown error)")
                );
            }
        }
        if let Some(error) = &report.error {
            eprintln!("Error: {}", error);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("COURSESYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Parse arguments, then run the selected command
fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(code) => code,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn exit_code_for(status: SyncStatus) -> i32 {
    match status {
        SyncStatus::Success => 0,
        SyncStatus::Partial => 1,
        SyncStatus::Failed => 2,
    }
}

/// Credentials from the environment win over the config file.
fn apply_env_credentials(config: &mut SyncConfig) {
    if let Ok(username) = std::env::var("COURSESYNC_USERNAME") {
        config.username = Some(username);
    }
    if let Ok(password) = std::env::var("COURSESYNC_PASSWORD") {
        config.password = Some(password);
    }
}

fn build_engine(args: &Args, progress: Arc<CliProgress>) -> Result<SyncEngine, String> {
    let mut config = SyncConfig::load_or_default(args.config.as_deref())
        .map_err(|e| format!("Invalid configuration: {}", e))?;
    apply_env_credentials(&mut config);
    debug!(
        config = ?args.config,
        download_dir = %config.download_dir.display(),
        portal = ?args.portal,
        "configuration loaded"
    );

    let portal: Arc<dyn PortalSession> = match &args.portal {
        Some(root) => Arc::new(
            FsPortal::open(root.clone()).map_err(|e| format!("Invalid portal: {}", e))?,
        ),
        None => Arc::new(NoPortal),
    };
    SyncEngine::new(config, portal, progress).map_err(|e| format!("Failed to start engine: {}", e))
}

fn needs_portal(command: &Command) -> bool {
    matches!(command, Command::Sync | Command::Courses { refresh: true })
}

/// Main CLI logic - separated for testability. Returns the exit code.
fn run_cli(args: &Args) -> Result<i32, String> {
    if needs_portal(&args.command) {
        match &args.portal {
            Some(root) if !root.is_dir() => {
                return Err(format!("Portal directory does not exist: {}", root.display()));
            }
            Some(_) => {}
            None => return Err("This command needs a portal; pass --portal <DIR>".to_string()),
        }
    }

    let engine = build_engine(args, Arc::new(CliProgress::new(args.verbose)))?;

    match &args.command {
        Command::Sync => {
            eprintln!("Syncing into {}", engine.download_dir().display());
            let report = engine.start_sync().map_err(|e| format!("Sync failed: {}", e))?;
            Ok(exit_code_for(report.status))
        }
        Command::Courses { refresh } => {
            let courses = if *refresh {
                engine
                    .refresh_courses()
                    .map_err(|e| format!("Failed to fetch courses: {}", e))?
            } else {
                engine.courses()
            };
            if courses.is_empty() {
                println!("No courses known yet; run `coursesync courses --refresh`.");
            }
            for course in &courses {
                print_course(course);
            }
            Ok(0)
        }
        Command::Course {
            id,
            alias,
            clear_alias,
            enable,
            disable,
            tabs,
        } => {
            let update = CourseUpdate {
                alias: if *clear_alias {
                    Some(None)
                } else {
                    alias.clone().map(Some)
                },
                enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                selected_tabs: tabs.as_ref().map(|tabs| {
                    tabs.iter()
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                }),
            };
            if update == CourseUpdate::default() {
                return Err("Nothing to change; pass --alias, --clear-alias, --enable, --disable, or --tabs".to_string());
            }
            let course = engine
                .update_course_config(id, update)
                .map_err(|e| format!("Failed to update course: {}", e))?;
            print_course(&course);
            Ok(0)
        }
        Command::Reports { limit } => {
            let reports = engine
                .get_sync_reports(*limit)
                .map_err(|e| format!("Failed to read reports: {}", e))?;
            if reports.is_empty() {
                println!("No syncs recorded yet.");
            }
            for report in &reports {
                println!(
                    "{}  {}  {:<8} {} downloaded, {} skipped, {} failed",
                    report.sync_id,
                    report.started_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                    report.status.to_string(),
                    report.summary.downloaded,
                    report.summary.skipped,
                    report.summary.failed
                );
            }
            Ok(0)
        }
        Command::Report { sync_id } => {
            let report = engine
                .get_sync_report(sync_id)
                .map_err(|e| format!("Failed to read report: {}", e))?
                .ok_or_else(|| format!("No report with id {}", sync_id))?;
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(0)
        }
        Command::Stats => {
            let stats = engine.get_local_stats();
            for (course, count) in &stats.courses {
                println!("{:>6}  {}", count, course);
            }
            println!("{:>6}  total", stats.total_files);
            Ok(0)
        }
    }
}

fn print_course(course: &CourseRef) {
    let name = match &course.user_alias {
        Some(alias) => format!("{} (portal: {})", alias, course.canonical_name),
        None => course.canonical_name.clone(),
    };
    let tabs: Vec<String> = course
        .available_tabs
        .iter()
        .map(|tab| {
            if course.selected_tabs.contains(tab) {
                format!("[x] {}", tab)
            } else {
                format!("[ ] {}", tab)
            }
        })
        .collect();
    println!(
        "{}  {}{}",
        course.id,
        name,
        if course.enabled { "" } else { "  (disabled)" }
    );
    if !tabs.is_empty() {
        println!("    {}", tabs.join("  "));
    }
}

//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use splitfetch_core::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use splitfetch_core::{EngineConfig, ScheduleRule};

use crate::app_config::{FileConfig, VerbositySetting, resolve_default_db_path};

/// Segmented, resumable HTTP downloader.
///
/// Splits each download into byte ranges fetched in parallel and resumes
/// interrupted downloads from their last checkpoint. Run without URLs to
/// continue unfinished downloads from the database.
#[derive(Parser, Debug)]
#[command(name = "splitfetch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Directory (or, for a single URL, file path) to save into
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub concurrency: Option<u16>,

    /// Segment fetchers per download (1-32)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u16).range(1..=32))]
    pub threads: Option<u16>,

    /// Aggregate bandwidth limit in bytes per second (0 for unlimited)
    #[arg(short = 'l', long)]
    pub limit: Option<u64>,

    /// Task-level retries before a download fails
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: Option<u32>,

    /// Expected digest, `sha256:<hex>` or bare hex (single URL only)
    #[arg(long)]
    pub checksum: Option<String>,

    /// File downloads into per-type subdirectories (videos, archives, ...)
    #[arg(long)]
    pub organize: bool,

    /// Task database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Start the downloads after this many seconds
    #[arg(long, conflicts_with = "every_secs")]
    pub delay_secs: Option<u64>,

    /// Repeat the downloads every this many seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub every_secs: Option<u64>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Effective settings after merging CLI flags over file defaults.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub engine: EngineConfig,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub schedule: Option<ScheduleRule>,
    pub log_filter: &'static str,
}

impl Args {
    /// Merges flags over `file` defaults over built-in defaults.
    pub fn settings(&self, file: Option<&FileConfig>) -> Result<RunSettings> {
        let file = file.cloned().unwrap_or_default();
        if self.checksum.is_some() && self.urls.len() > 1 {
            bail!("--checksum applies to a single URL, got {}", self.urls.len());
        }

        let mut engine = EngineConfig::default();
        if let Some(concurrency) = self.concurrency.map(usize::from).or(file.concurrency) {
            engine.max_concurrent_downloads = concurrency;
        }
        if let Some(threads) = self.threads.map(usize::from).or(file.threads) {
            engine.max_threads_per_download = threads;
        }
        if let Some(retries) = self.max_retries.or(file.max_retries) {
            engine.task_max_retries = retries;
        }
        if let Some(size) = file.min_segment_size {
            engine.min_segment_size = size;
        }
        engine.organize_by_category = self.organize || file.organize.unwrap_or(false);
        engine.bandwidth_limit = self.limit.or(file.bandwidth_limit).filter(|rate| *rate > 0);
        engine.validate()?;

        let schedule = match (self.delay_secs, self.every_secs) {
            (Some(delay), _) => Some(ScheduleRule::after(Duration::from_secs(delay))),
            (None, Some(every)) => Some(ScheduleRule::every(Duration::from_secs(every))),
            (None, None) => None,
        };

        let verbosity = if self.quiet {
            VerbositySetting::Quiet
        } else {
            match self.verbose {
                0 => file.verbosity.unwrap_or(VerbositySetting::Default),
                1 => VerbositySetting::Verbose,
                _ => VerbositySetting::Debug,
            }
        };

        Ok(RunSettings {
            engine,
            output_dir: self
                .output_dir
                .clone()
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            db_path: self
                .db
                .clone()
                .or(file.db_path)
                .unwrap_or_else(resolve_default_db_path),
            connect_timeout_secs: file.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
            read_timeout_secs: file.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
            schedule,
            log_filter: verbosity.filter(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["splitfetch"]).unwrap();
        assert!(args.urls.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);

        let settings = args.settings(None).unwrap();
        assert_eq!(settings.engine, EngineConfig::default());
        assert_eq!(settings.output_dir, PathBuf::from("."));
        assert_eq!(settings.log_filter, "info");
        assert!(settings.schedule.is_none());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["splitfetch", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.settings(None).unwrap().log_filter, "trace");
    }

    #[test]
    fn test_cli_quiet_conflicts_with_verbose() {
        let result = Args::try_parse_from(["splitfetch", "-q", "-v"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["splitfetch", "--help"]);
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_threads_zero_rejected() {
        let result = Args::try_parse_from(["splitfetch", "-t", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_flags_override_file_config() {
        let args = Args::try_parse_from([
            "splitfetch",
            "-c",
            "5",
            "-l",
            "0",
            "https://example.com/a.iso",
        ])
        .unwrap();
        let file = FileConfig {
            concurrency: Some(2),
            threads: Some(4),
            bandwidth_limit: Some(1024),
            output_dir: Some(PathBuf::from("/data")),
            verbosity: Some(VerbositySetting::Quiet),
            ..FileConfig::default()
        };

        let settings = args.settings(Some(&file)).unwrap();
        assert_eq!(settings.engine.max_concurrent_downloads, 5);
        assert_eq!(settings.engine.max_threads_per_download, 4);
        assert_eq!(settings.engine.bandwidth_limit, None, "0 means unlimited");
        assert_eq!(settings.output_dir, PathBuf::from("/data"));
        assert_eq!(settings.log_filter, "error");
    }

    #[test]
    fn test_cli_organize_from_flag_or_file() {
        let plain = Args::try_parse_from(["splitfetch"]).unwrap();
        assert!(!plain.settings(None).unwrap().engine.organize_by_category);

        let file = FileConfig {
            organize: Some(true),
            ..FileConfig::default()
        };
        assert!(plain.settings(Some(&file)).unwrap().engine.organize_by_category);

        let flagged = Args::try_parse_from(["splitfetch", "--organize"]).unwrap();
        assert!(flagged.settings(None).unwrap().engine.organize_by_category);
    }

    #[test]
    fn test_cli_schedule_flags() {
        let args = Args::try_parse_from(["splitfetch", "--every-secs", "60", "https://a/b"]).unwrap();
        assert!(matches!(
            args.settings(None).unwrap().schedule,
            Some(ScheduleRule::Recurring { interval_ms: 60_000, .. })
        ));

        let conflict =
            Args::try_parse_from(["splitfetch", "--delay-secs", "5", "--every-secs", "60"]);
        assert!(conflict.is_err());
    }

    #[test]
    fn test_cli_checksum_requires_single_url() {
        let args = Args::try_parse_from([
            "splitfetch",
            "--checksum",
            "sha256:00",
            "https://a/1",
            "https://a/2",
        ])
        .unwrap();
        assert!(args.settings(None).is_err());
    }
}

//! Log filter selection, the rolling log file and crash artifacts.
//!
//! Pipeline stages tag their blocking-pool thread with the active model, stage and tile through
//! [`enter_stage`]. A panic on a tagged thread writes those fields into its crash artifact.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::fs;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::model::Model;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";

const LOG_FILE_PREFIX: &str = "tilescale";
const LOG_RETENTION_FILES: usize = 14;
/// Per-worker pipeline summaries are debug level; the log file keeps them by default.
const FILE_DETAIL_DIRECTIVE: &str = "tilescale_core::pipeline=debug";

static CRASH_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
static CRASH_WRITE_ACTIVE: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static STAGE: RefCell<Option<StageContext>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
}

/// Directives for the console and file layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` beats `-v`/`-vv`, which beat `RUST_LOG`, which beats [`DEFAULT_LOG_FILTER`].
    /// An explicit choice is used verbatim on both layers; otherwise ORT noise is muted and the
    /// file additionally records pipeline stage summaries.
    pub fn select(options: &LoggingInitOptions) -> Self {
        let explicit = options.cli_log_filter.clone().or(match options.verbose {
            0 => None,
            1 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        });
        if let Some(filter) = explicit {
            return Self {
                console: filter.clone(),
                file: filter,
            };
        }

        let base = options
            .rust_log_env
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER);
        Self {
            console: format!("{DEFAULT_NOISE_FILTER},{base}"),
            file: format!("{DEFAULT_NOISE_FILTER},{FILE_DETAIL_DIRECTIVE},{base}"),
        }
    }
}

/// Where the file layer writes, or why there is no file layer.
#[derive(Debug)]
pub enum FileSink {
    Rolling {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    /// Daily-rotated `tilescale.*.log` files under `<data_dir>/logs`.
    pub fn open(data_dir: Option<&Path>) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::ConsoleOnly {
                attempted_log_dir: None,
                reason: "no data directory configured".to_string(),
            };
        };

        let log_dir = data_dir.join(LOG_DIR_NAME);
        let appender = fs::create_dir_all(&log_dir)
            .map_err(|e| format!("cannot create log directory: {e}"))
            .and_then(|()| {
                RollingFileAppender::builder()
                    .rotation(Rotation::DAILY)
                    .filename_prefix(LOG_FILE_PREFIX)
                    .filename_suffix("log")
                    .max_log_files(LOG_RETENTION_FILES)
                    .build(&log_dir)
                    .map_err(|e| format!("cannot open rolling log file: {e}"))
            });

        match appender {
            Ok(appender) => Self::Rolling { log_dir, appender },
            Err(reason) => Self::ConsoleOnly {
                attempted_log_dir: Some(log_dir),
                reason,
            },
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Rolling { log_dir, .. } => Some(log_dir),
            Self::ConsoleOnly {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

/// What a pipeline thread is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    pub model: Model,
    pub stage: &'static str,
    pub tile: Option<usize>,
}

/// Clears the thread's [`StageContext`] on drop. Blocking-pool threads outlive a run.
#[must_use]
pub struct StageGuard {
    _private: (),
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let _ = STAGE.try_with(|slot| slot.borrow_mut().take());
    }
}

pub fn enter_stage(model: Model, stage: &'static str) -> StageGuard {
    STAGE.with(|slot| {
        *slot.borrow_mut() = Some(StageContext {
            model,
            stage,
            tile: None,
        })
    });
    StageGuard { _private: () }
}

pub fn record_tile(index: usize) {
    STAGE.with(|slot| {
        if let Some(context) = slot.borrow_mut().as_mut() {
            context.tile = Some(index);
        }
    });
}

pub fn current_stage() -> Option<StageContext> {
    STAGE
        .try_with(|slot| slot.try_borrow().ok().and_then(|context| *context))
        .ok()
        .flatten()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Disabled {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Chain a panic hook that writes one artifact per panic under `<data_dir>/logs/crash` before
/// the previous hook runs. Only the first successful install takes effect.
pub fn install_crash_hook(data_dir: Option<&Path>) -> CrashHook {
    let mut installed = CRASH_DIR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(crash_dir) = installed.as_ref() {
        return CrashHook::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return CrashHook::Disabled {
            attempted_crash_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };
    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return CrashHook::Disabled {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("cannot create crash directory: {error}"),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    *installed = Some(crash_dir.clone());
    CrashHook::Installed { crash_dir }
}

struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    stage: Option<StageContext>,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info.location().map_or_else(
                || "<unknown>".to_string(),
                |l| format!("{}:{}:{}", l.file(), l.line(), l.column()),
            ),
            payload: payload_text(info.payload()),
            stage: current_stage(),
            backtrace: Backtrace::capture(),
        }
    }

    fn file_name(&self, sequence: u64) -> String {
        let stage = self.stage.map_or("main", |context| context.stage);
        format!(
            "panic-{}-{stage}-{sequence:04}.log",
            self.timestamp.format("%Y%m%d-%H%M%S%.3f")
        )
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "timestamp_utc={}", self.timestamp.to_rfc3339());
        let _ = writeln!(out, "thread={}", self.thread);
        let _ = writeln!(out, "location={}", self.location);
        let _ = writeln!(out, "payload={}", self.payload);
        match self.stage {
            Some(context) => {
                let _ = writeln!(out, "model={}", context.model);
                let _ = writeln!(out, "stage={}", context.stage);
                let tile = context.tile.map_or_else(|| "-".to_string(), |t| t.to_string());
                let _ = writeln!(out, "tile={tile}");
            }
            None => {
                let _ = writeln!(out, "stage=none");
            }
        }
        match self.backtrace.status() {
            BacktraceStatus::Captured => {
                let _ = writeln!(out, "backtrace:\n{}", self.backtrace);
            }
            BacktraceStatus::Disabled => {
                let _ = writeln!(out, "backtrace: disabled (set RUST_BACKTRACE=1)");
            }
            _ => {
                let _ = writeln!(out, "backtrace: unsupported");
            }
        }
        out
    }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if CRASH_WRITE_ACTIVE.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash hook failed while writing under '{}'",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_ACTIVE.store(false, Ordering::Release);
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(report.file_name(sequence));
    fs::write(&path, report.render())?;
    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

//! Logging bootstrap
//!
//! Console output plus a dated log file per service. The file rolls at
//! midnight and when it grows past `max_file_size`; SIGHUP reopens it after
//! external rotation, and a daily task gzips and later deletes old files.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const DAY: Duration = Duration::from_secs(86_400);

/// `2025-01-01T12:00:00.000000Z [INFO] message`
///
/// Events whose target is not a module path (knxd output forwarded under the
/// `knxd` target) are tagged `<target>`.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let (tag, color) = match *meta.level() {
            Level::TRACE => ("[TRACE]", "35"),
            Level::DEBUG => ("[DEBUG]", "34"),
            Level::INFO => ("[INFO]", "32"),
            Level::WARN => ("[WARN]", "33"),
            Level::ERROR => ("[ERROR]", "31"),
        };
        write!(writer, "{} ", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        if writer.has_ansi_escapes() {
            write!(writer, "\x1b[{}m{}\x1b[0m ", color, tag)?;
        } else {
            write!(writer, "{} ", tag)?;
        }

        let target = meta.target();
        if !target.contains("::") && meta.module_path() != Some(target) {
            write!(writer, "<{}> ", target)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Log root: `KNX_LOG_DIR` env, then the configured directory, then `logs`
pub fn resolve_log_dir(configured: Option<&str>) -> PathBuf {
    std::env::var("KNX_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(configured.unwrap_or("logs")))
}

fn poisoned<T>(_: PoisonError<T>) -> std::io::Error {
    std::io::Error::other("log writer lock poisoned")
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

/// `{YYYYMMDD}_{service}.log`, or `{YYYYMMDD}_{service}.{part}.log` after a
/// size roll
fn log_path(dir: &Path, date: &str, service: &str, part: u32) -> PathBuf {
    if part == 0 {
        dir.join(format!("{}_{}.log", date, service))
    } else {
        dir.join(format!("{}_{}.{}.log", date, service, part))
    }
}

struct OpenLog {
    date: String,
    part: u32,
    size: u64,
    file: File,
}

/// File sink rolling by date and size
struct RollingFile {
    service: String,
    dir: PathBuf,
    max_size: u64,
    state: Mutex<OpenLog>,
}

impl RollingFile {
    fn open(service: &str, dir: &Path, max_size: u64) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let state = Self::open_part(service, dir, today(), 0)?;
        Ok(Self {
            service: service.to_string(),
            dir: dir.to_path_buf(),
            max_size,
            state: Mutex::new(state),
        })
    }

    fn open_part(service: &str, dir: &Path, date: String, part: u32) -> std::io::Result<OpenLog> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(dir, &date, service, part))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(OpenLog {
            date,
            part,
            size,
            file,
        })
    }

    fn write_line(&self, buf: &[u8]) -> std::io::Result<usize> {
        let mut log = self.state.lock().map_err(poisoned)?;

        let date = today();
        if log.date != date {
            *log = Self::open_part(&self.service, &self.dir, date, 0)?;
        } else if !log_path(&self.dir, &log.date, &self.service, log.part).exists() {
            // Removed underneath us; start it again
            fs::create_dir_all(&self.dir)?;
            *log = Self::open_part(&self.service, &self.dir, date, log.part)?;
        } else if log.size > 0 && log.size + buf.len() as u64 > self.max_size {
            let part = log.part + 1;
            *log = Self::open_part(&self.service, &self.dir, date, part)?;
        }

        let written = log.file.write(buf)?;
        log.size += written as u64;
        Ok(written)
    }
}

/// `io::Write` handle handed to the non-blocking appender
struct RollingHandle(Arc<RollingFile>);

impl Write for RollingHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_line(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.state.lock().map_err(poisoned)?.file.flush()
    }
}

/// File layer writer whose target can be swapped on reopen
#[derive(Clone, Default)]
struct SwappableWriter(Arc<Mutex<Option<NonBlocking>>>);

impl Write for SwappableWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock().map_err(poisoned)?.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock().map_err(poisoned)?.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl MakeWriter<'_> for SwappableWriter {
    type Writer = Self;

    fn make_writer(&self) -> Self::Writer {
        self.clone()
    }
}

/// Everything a reopen needs, plus the live appender guard
struct FileSink {
    service: String,
    dir: PathBuf,
    max_size: u64,
    writer: SwappableWriter,
    guard: Option<WorkerGuard>,
}

static FILE_SINK: OnceLock<Mutex<FileSink>> = OnceLock::new();

impl FileSink {
    /// Point the file layer at a freshly opened file; the old guard drops
    /// after the swap and flushes what it still holds
    fn attach(&mut self) -> std::io::Result<()> {
        let file = RollingFile::open(&self.service, &self.dir, self.max_size)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(RollingHandle(Arc::new(file)));
        *self.writer.0.lock().map_err(poisoned)? = Some(non_blocking);
        self.guard = Some(guard);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Names the log files and the default filter target
    pub service_name: String,
    pub log_dir: PathBuf,
    /// `info`, `debug`, ... or a full filter like `info,knxsrv::bridge=trace`
    pub level: String,
    /// JSON lines in the file instead of the plain line format
    pub enable_json: bool,
    pub max_file_size: u64,
    /// Plain files older than this are gzipped
    pub compress_after_days: u64,
    /// Gzipped files older than this are deleted
    pub delete_after_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "knxsrv".to_string(),
            log_dir: resolve_log_dir(None),
            level: "info".to_string(),
            enable_json: false,
            max_file_size: 50 * 1024 * 1024,
            compress_after_days: 7,
            delete_after_days: 90,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` when set; a bare level also applies to the service target
    fn filter_spec(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(env) if !env.trim().is_empty() => env,
            _ if self.level.contains(['=', ',']) => self.level.clone(),
            _ => format!("{},{}={}", self.level, self.service_name, self.level),
        }
    }
}

/// Install the global subscriber
///
/// Needs a running Tokio runtime for the retention task.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(config.filter_spec())?;

    let mut sink = FileSink {
        service: config.service_name.clone(),
        dir: config.log_dir.clone(),
        max_size: config.max_file_size,
        writer: SwappableWriter::default(),
        guard: None,
    };
    sink.attach()?;
    let writer = sink.writer.clone();
    if FILE_SINK.set(Mutex::new(sink)).is_err() {
        return Err("logging already initialized".into());
    }

    let file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .event_format(LineFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).event_format(LineFormat))
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging to {}", config.log_dir.display());
    spawn_retention_task(config);
    Ok(())
}

/// Reopen the log file, e.g. after logrotate moved it away
pub fn reopen_logs_now() -> Result<(), Box<dyn std::error::Error>> {
    let sink = FILE_SINK.get().ok_or("logging not initialized")?;
    sink.lock().map_err(|_| "log sink lock poisoned")?.attach()?;
    tracing::debug!("Log file reopened");
    Ok(())
}

/// Reopen logs on SIGHUP (Unix only)
pub fn enable_sighup_log_reopen() {
    #[cfg(unix)]
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(hup) => hup,
            Err(e) => {
                tracing::warn!("SIGHUP handler not installed: {}", e);
                return;
            },
        };
        while hup.recv().await.is_some() {
            if let Err(e) = reopen_logs_now() {
                tracing::warn!("Log reopen on SIGHUP failed: {}", e);
            }
        }
    });
}

/// First pass a minute after start, then once a day
fn spawn_retention_task(config: LogConfig) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut ticker = tokio::time::interval(DAY);
        loop {
            ticker.tick().await;
            if let Err(e) = apply_retention(
                &config.log_dir,
                &config.service_name,
                DAY * config.compress_after_days as u32,
                DAY * config.delete_after_days as u32,
            )
            .await
            {
                tracing::error!("Log retention pass failed: {}", e);
            }
        }
    });
}

/// Gzip this service's aged `.log` files and delete aged `.log.gz` files
async fn apply_retention(
    dir: &Path,
    service: &str,
    compress_after: Duration,
    delete_after: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let marker = format!("_{}", service);
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !name.contains(&marker) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();

        if name.ends_with(".log.gz") {
            if age >= delete_after {
                tokio::fs::remove_file(&path).await?;
                tracing::debug!("Deleted old log {}", name);
            }
        } else if name.ends_with(".log") && age >= compress_after {
            gzip_file(&path).await?;
            tokio::fs::remove_file(&path).await?;
            tracing::debug!("Compressed log {}", name);
        }
    }
    Ok(())
}

/// Writes `path.gz` next to `path`
async fn gzip_file(path: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path).await?;
    let target = PathBuf::from(format!("{}.gz", path.display()));
    let mut encoder = GzEncoder::new(File::create(&target)?, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    Ok(target)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_rolling_file_splits_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(RollingFile::open("knxsrv", dir.path(), 16).unwrap());
        let mut handle = RollingHandle(file);

        handle.write_all(b"telegram 1/0/1\n").unwrap();
        handle.write_all(b"telegram 1/0/2\n").unwrap();
        handle.flush().unwrap();

        let date = today();
        let first = fs::read_to_string(log_path(dir.path(), &date, "knxsrv", 0)).unwrap();
        let second = fs::read_to_string(log_path(dir.path(), &date, "knxsrv", 1)).unwrap();
        assert_eq!(first, "telegram 1/0/1\n");
        assert_eq!(second, "telegram 1/0/2\n");
    }

    #[test]
    fn test_rolling_file_recreates_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(RollingFile::open("knxsrv", dir.path(), 1024).unwrap());
        let path = log_path(dir.path(), &today(), "knxsrv", 0);
        fs::remove_file(&path).unwrap();

        let mut handle = RollingHandle(file);
        handle.write_all(b"after removal\n").unwrap();
        handle.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "after removal\n");
    }

    #[tokio::test]
    async fn test_gzip_file_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20250101_knxsrv.log");
        fs::write(&path, "line one\nline two\n").unwrap();

        let gz = gzip_file(&path).await.unwrap();
        let mut text = String::new();
        flate2::read::GzDecoder::new(File::open(gz).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_retention_only_touches_own_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20250101_knxsrv.log"), "ours").unwrap();
        fs::write(dir.path().join("20250101_other.log"), "theirs").unwrap();

        apply_retention(dir.path(), "knxsrv", Duration::ZERO, DAY)
            .await
            .unwrap();

        assert!(dir.path().join("20250101_knxsrv.log.gz").exists());
        assert!(!dir.path().join("20250101_knxsrv.log").exists());
        assert!(dir.path().join("20250101_other.log").exists());
    }

    #[test]
    fn test_plain_level_applies_to_service_target() {
        let config = LogConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(config.filter_spec(), "debug,knxsrv=debug");
        }
        let config = LogConfig {
            level: "warn,knxsrv::bridge=trace".to_string(),
            ..Default::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(config.filter_spec(), "warn,knxsrv::bridge=trace");
        }
    }
}

pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Log file written by `init_tracing`.
pub const LOG_FILE_NAME: &str = "supervisor.log";

/// Rotated generations kept next to the live log.
const LOG_GENERATIONS: u32 = 3;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "mcp_lifecycle=info,warn";

/// Return the platform-standard data directory for the supervisor.
///
/// - macOS: `~/Library/Application Support/mcp-lifecycle/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-lifecycle\`
/// - Linux: `$XDG_DATA_HOME/mcp-lifecycle/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-lifecycle/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-lifecycle");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-lifecycle")
}

/// Initialize the tracing subscriber, writing to `supervisor.log` in `log_dir`.
///
/// On each startup:
/// 1. Rotates existing logs (supervisor.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `MCP_LIFECYCLE_LOG_FORMAT=json` switches to JSON lines. Returns the path
/// of the live log file.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_GENERATIONS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("MCP_LIFECYCLE_LOG_FORMAT")
        .is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let installed = if json {
        fmt::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .try_init()
    } else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
    };
    installed.map_err(|e| std::io::Error::other(format!("failed to install subscriber: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-lifecycle starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `supervisor.log` → `supervisor.log.1` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// The supervisor is often killed along with its children; each log line
/// must already be on disk when that happens.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        let gen = |n: u32| PathBuf::from(format!("{}.{n}", log.display()));

        std::fs::write(&log, "current").unwrap();
        std::fs::write(gen(1), "one").unwrap();
        std::fs::write(gen(3), "three").unwrap();

        rotate_log_file(&log, 3);

        assert!(!log.exists());
        assert_eq!(std::fs::read_to_string(gen(1)).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(gen(2)).unwrap(), "one");
        // The old .3 was dropped and nothing shifted into it.
        assert!(!gen(3).exists());
    }

    #[test]
    fn test_rotate_log_file_without_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        rotate_log_file(&log, 3);
        assert!(!log.exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"line two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        let dir = data_dir();
        let last = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(last.contains("mcp-lifecycle"));
    }
}

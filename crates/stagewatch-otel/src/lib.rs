use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minutely" => Rotation::Minutely,
            "hourly" => Rotation::Hourly,
            "never" => Rotation::Never,
            _ => Rotation::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSink {
    dir: PathBuf,
    prefix: String,
    rotation: Rotation,
}

/// Rolling file output is opt-in through `STAGEWATCH_LOG_ROLL=1`.
fn file_sink_from_env() -> Option<FileSink> {
    if std::env::var("STAGEWATCH_LOG_ROLL").ok().as_deref() != Some("1") {
        return None;
    }
    let dir = std::env::var("STAGEWATCH_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let prefix = std::env::var("STAGEWATCH_LOG_PREFIX").unwrap_or_else(|_| "stagewatch".into());
    let rotation = std::env::var("STAGEWATCH_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    Some(FileSink {
        dir: PathBuf::from(dir),
        prefix,
        rotation: Rotation::parse(&rotation),
    })
}

/// Install the global subscriber. Console output goes to stderr so stdout
/// stays free for command output; calling this twice is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(sink) = file_sink_from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&sink.dir).is_err() {
        eprintln!("stagewatch: failed to create log directory {}", sink.dir.display());
    }
    let writer = match sink.rotation {
        Rotation::Minutely => tracing_appender::rolling::minutely(&sink.dir, &sink.prefix),
        Rotation::Hourly => tracing_appender::rolling::hourly(&sink.dir, &sink.prefix),
        Rotation::Never => tracing_appender::rolling::never(&sink.dir, &sink.prefix),
        Rotation::Daily => tracing_appender::rolling::daily(&sink.dir, &sink.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_filter = EnvFilter::try_from_env("STAGEWATCH_LOG_FILE_FILTER")
        .unwrap_or_else(|_| EnvFilter::new("stagewatch_core=debug,info"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    let _ = registry.with(file_layer).try_init();
    tracing::debug!(dir = %sink.dir.display(), prefix = %sink.prefix, "rolling log file enabled");
}

//! ログ初期化
//!
//! コンソール出力（text / json）と、`log_dir` 指定時のローテーション付き
//! ファイル出力を構成します。`RUST_LOG` が設定されていれば設定値より優先します。

use crate::config::{LogFormat, LogRotation, LoggingSettings};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// ログファイル名のプレフィックス
pub const LOG_FILE_PREFIX: &str = "mcp-orchestrator.log";

/// ログシステムを初期化
///
/// ファイル出力時は返された `WorkerGuard` をプロセス終了まで保持すること。
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(&settings.level);

    let console = match settings.format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let (file, guard) = match &settings.log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(appender(dir, settings.rotation)?);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            let layer = match settings.format {
                LogFormat::Text => layer.boxed(),
                LogFormat::Json => layer.json().boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::info!("📝 ログシステム初期化完了");
    tracing::debug!(level = %settings.level, format = ?settings.format, "Logging configured");
    if let Some(dir) = &settings.log_dir {
        tracing::info!("📂 ログディレクトリ: {}", dir.display());
    }

    Ok(guard)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// ローテーション設定に応じたファイル出力先
fn appender(dir: &Path, rotation: LogRotation) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    Ok(match rotation {
        LogRotation::Daily => rolling::daily(dir, LOG_FILE_PREFIX),
        LogRotation::Hourly => rolling::hourly(dir, LOG_FILE_PREFIX),
        LogRotation::Never => rolling::never(dir, LOG_FILE_PREFIX),
    })
}

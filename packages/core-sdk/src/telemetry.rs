use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE: &str = "codequill.log";

struct TelemetryState {
    enabled: bool,
    log_dir: PathBuf,
}

static TELEMETRY: Lazy<std::sync::RwLock<TelemetryState>> = Lazy::new(|| {
    std::sync::RwLock::new(TelemetryState {
        enabled: false,
        log_dir: PathBuf::from("logs"),
    })
});

/**
 * \brief 进程启动时初始化日志开关与目录。
 */
pub fn init(enabled: bool, log_dir: &Path) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.enabled = enabled;
        guard.log_dir = log_dir.to_path_buf();
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY.read().map(|g| g.enabled).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn current_log_dir() -> PathBuf {
    TELEMETRY
        .read()
        .map(|g| g.log_dir.clone())
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn format_line(timestamp: &str, level: &str, category: &str, message: &str) -> String {
    // 单行日志，换行会破坏按行检索
    let flat = message.replace(['\r', '\n'], " ");
    format!("{} [{}] {} - {}", timestamp, level, category, flat)
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = current_log_dir();
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    writeln!(file, "{}", format_line(&timestamp, level, category, message))?;
    Ok(())
}

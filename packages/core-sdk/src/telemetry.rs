use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

static EVENT_LOG: Lazy<std::sync::RwLock<Option<PathBuf>>> =
    Lazy::new(|| std::sync::RwLock::new(None));

/**
 * \brief 安装全局 tracing 订阅者，过滤规则取自 `RUST_LOG`，缺省为 info。
 */
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/**
 * \brief 设置事件日志文件；传入 None 关闭文件输出。
 */
pub fn set_event_log(path: Option<PathBuf>) {
    if let Ok(mut guard) = EVENT_LOG.write() {
        *guard = path;
    }
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category = category, "{}", message);
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!("event log write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(category = category, "{}", message);
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!("event log write failed: {}", err);
    }
}

/** \brief 当前 UTC 时间的 RFC 3339 字符串。 */
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let path = match EVENT_LOG.read().ok().and_then(|g| g.clone()) {
        Some(path) => path,
        None => return Ok(()),
    };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

use std::time::Duration;

use anyhow::{bail, Result};

use crate::models::DEFAULT_MODEL;

pub const DEFAULT_UPSTREAM_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/**
 * \brief 远端托管存储连接信息。
 */
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /** \brief 存储服务基地址 */
    pub url: String,
    /** \brief 服务端凭据，不可下发至浏览器 */
    pub service_key: String,
    pub timeout: Duration,
}

/**
 * \brief 服务端配置：启动时从环境变量读取一次，之后显式传递。
 */
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /** \brief 环境变量提供的 AI 密钥，优先级最高 */
    pub env_api_key: Option<String>,
    /** \brief 静态加密所用的服务端密钥 */
    pub encryption_secret: Option<String>,
    /** \brief 存储中未指定模型时使用的模型名 */
    pub ai_model: String,
    /** \brief 配置后使用远端存储，否则使用本地 SQLite */
    pub remote_store: Option<RemoteStoreConfig>,
    pub db_path: String,
    pub upstream_base: String,
    pub upstream_timeout: Duration,
    pub site_dir: String,
    pub site_fallback: String,
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env_api_key: None,
            encryption_secret: None,
            ai_model: DEFAULT_MODEL.to_string(),
            remote_store: None,
            db_path: "studydesk.db".to_string(),
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
            upstream_timeout: Duration::from_secs(30),
            site_dir: "site/dist".to_string(),
            site_fallback: "web".to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /**
     * \brief 从进程环境读取配置。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /**
     * \brief 从任意查找函数读取配置，空白值视为未设置。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let store_url = get("STUDYDESK_STORE_URL");
        let remote_store = match (store_url, get("STUDYDESK_STORE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => Some(RemoteStoreConfig {
                url: url.trim_end_matches('/').to_string(),
                service_key,
                timeout: Duration::from_secs(parse_secs(
                    get("STUDYDESK_STORE_TIMEOUT_SECS"),
                    10,
                    "STUDYDESK_STORE_TIMEOUT_SECS",
                )?),
            }),
            (Some(_), None) => {
                bail!("STUDYDESK_STORE_SERVICE_KEY is required when STUDYDESK_STORE_URL is set")
            }
            _ => None,
        };

        Ok(Self {
            env_api_key: get("STUDYDESK_AI_API_KEY").or_else(|| get("GEMINI_API_KEY")),
            encryption_secret: get("STUDYDESK_AI_CONFIG_SECRET"),
            ai_model: get("STUDYDESK_AI_MODEL").unwrap_or(defaults.ai_model),
            remote_store,
            db_path: get("STUDYDESK_DB_PATH").unwrap_or(defaults.db_path),
            upstream_base: get("STUDYDESK_UPSTREAM_BASE").unwrap_or(defaults.upstream_base),
            upstream_timeout: Duration::from_secs(parse_secs(
                get("STUDYDESK_UPSTREAM_TIMEOUT_SECS"),
                30,
                "STUDYDESK_UPSTREAM_TIMEOUT_SECS",
            )?),
            site_dir: get("STUDYDESK_SITE_DIR").unwrap_or(defaults.site_dir),
            site_fallback: get("STUDYDESK_SITE_FALLBACK").unwrap_or(defaults.site_fallback),
            log_file: get("STUDYDESK_LOG_FILE"),
        })
    }
}

fn parse_secs(raw: Option<String>, default: u64, name: &str) -> Result<u64> {
    match raw {
        None => Ok(default),
        Some(v) => match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => bail!("{} must be a positive integer, got {:?}", name, v),
        },
    }
}

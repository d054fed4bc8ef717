use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::crypto::{key_preview, SecretCipher};
use crate::errors::{ApiError, KEY_NOT_CONFIGURED_MESSAGE};
use crate::models::{
    AiConfigRecord, AiConfigSummary, AiConfigUpdate, KeySource, Principal, DEFAULT_MODEL,
    DEFAULT_PROVIDER,
};
use crate::store::ContentStore;
use crate::telemetry;

/** \brief 解密后密钥的缓存有效期。 */
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CachedKey {
    credentials: Credentials,
    expires_at: Instant,
}

/**
 * \brief 一次上游调用所需的凭据：密钥与模型名。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub model: String,
}

/**
 * \brief AI 密钥解析与写入。
 * \details 解析顺序：环境变量 → 进程内缓存 → 存储中的密文。
 * 任何下游失败都降级为“未配置”，不向调用方抛出。
 */
pub struct SecretResolver {
    store: Arc<dyn ContentStore>,
    env_key: Option<String>,
    cipher: Option<SecretCipher>,
    default_model: String,
    ttl: Duration,
    cache: Mutex<Option<CachedKey>>,
    /** \brief 每次失效递增；读取期间发生过失效的结果不得写回缓存 */
    generation: AtomicU64,
}

impl SecretResolver {
    pub fn new(
        store: Arc<dyn ContentStore>,
        env_key: Option<String>,
        encryption_secret: Option<&str>,
    ) -> Self {
        Self {
            store,
            env_key: env_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            cipher: encryption_secret
                .filter(|s| !s.is_empty())
                .map(SecretCipher::from_secret),
            default_model: DEFAULT_MODEL.to_string(),
            ttl: CACHE_TTL,
            cache: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /**
     * \brief 未在存储中指定模型时使用的模型名（环境密钥路径始终使用它）。
     */
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /**
     * \brief 解析当前可用的 AI 密钥，不可用时返回 None。
     */
    pub async fn resolve(&self) -> Option<String> {
        self.credentials().await.map(|c| c.api_key)
    }

    /**
     * \brief 解析密钥与模型；环境密钥直接返回且不缓存，存储密钥解密后缓存。
     */
    pub async fn credentials(&self) -> Option<Credentials> {
        if let Some(key) = &self.env_key {
            return Some(Credentials {
                api_key: key.clone(),
                model: self.default_model.clone(),
            });
        }
        if let Some(credentials) = self.cached() {
            return Some(credentials);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let record = match self.store.load_ai_config().await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("ai_config lookup failed: {:#}", err);
                return None;
            }
        };
        let record = record?;
        let encrypted = record
            .encrypted_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())?;
        let Some(cipher) = &self.cipher else {
            tracing::warn!("stored AI key present but encryption secret is not configured");
            return None;
        };
        match cipher.decrypt(encrypted) {
            Ok(api_key) => {
                let credentials = Credentials {
                    api_key,
                    model: non_blank(record.model.as_deref())
                        .unwrap_or_else(|| self.default_model.clone()),
                };
                self.fill_cache(&credentials, generation);
                Some(credentials)
            }
            Err(err) => {
                tracing::warn!("stored AI key could not be decrypted: {}", err);
                None
            }
        }
    }

    /**
     * \brief 解析凭据；不可用时返回配置错误。
     */
    pub async fn require(&self) -> Result<Credentials, ApiError> {
        self.credentials()
            .await
            .ok_or_else(|| ApiError::configuration(KEY_NOT_CONFIGURED_MESSAGE))
    }

    /**
     * \brief 清空缓存，下一次解析将重新读取存储。
     * \details 同时递增代数，使失效前开始的读取无法把旧密钥写回缓存。
     */
    pub fn invalidate(&self) {
        let guard = self.cache.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut guard) = guard {
            *guard = None;
        }
    }

    /**
     * \brief 当前配置的管理端摘要。
     */
    pub async fn summary(&self) -> Result<AiConfigSummary, ApiError> {
        let record = self.store.load_ai_config().await?.unwrap_or_default();
        Ok(self.summarize(&record))
    }

    /**
     * \brief 管理员写入：加密新密钥、合并配置并立即使缓存失效。
     * \details 调用方必须已通过管理员校验。
     */
    pub async fn save_config(
        &self,
        update: AiConfigUpdate,
        actor: &Principal,
    ) -> Result<AiConfigSummary, ApiError> {
        let cipher = self.cipher.as_ref().ok_or_else(|| {
            ApiError::configuration("AI config encryption secret is not configured")
        })?;

        let new_key = update
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let mut record = self.store.load_ai_config().await?.unwrap_or_default();
        let has_stored_key = record
            .encrypted_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if new_key.is_none() && !has_stored_key {
            return Err(ApiError::validation("API key is required"));
        }

        if let Some(provider) = non_blank(update.provider.as_deref()) {
            record.provider = Some(provider);
        }
        if let Some(model) = non_blank(update.model.as_deref()) {
            record.model = Some(model);
        }
        if let Some(key) = new_key {
            record.encrypted_key = Some(cipher.encrypt(key)?);
            record.key_preview = Some(key_preview(key));
        }
        record.updated_at = Some(telemetry::now_rfc3339());
        record.updated_by = Some(actor.audit_name());

        self.store.save_ai_config(&record).await?;
        self.invalidate();

        telemetry::log_event(
            "admin.ai_config",
            &format!(
                "saved by={} rotated={} preview={}",
                actor.audit_name(),
                new_key.is_some(),
                record.key_preview.as_deref().unwrap_or("-")
            ),
        );
        Ok(self.summarize(&record))
    }

    fn summarize(&self, record: &AiConfigRecord) -> AiConfigSummary {
        let stored = record
            .encrypted_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        let source = if self.env_key.is_some() {
            KeySource::Env
        } else if stored {
            KeySource::Store
        } else {
            KeySource::None
        };
        AiConfigSummary {
            provider: record
                .provider
                .clone()
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            model: record
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            key_preview: record.key_preview.clone(),
            updated_at: record.updated_at.clone(),
            updated_by: record.updated_by.clone(),
            source,
        }
    }

    fn cached(&self) -> Option<Credentials> {
        let guard = self.cache.lock().ok()?;
        guard
            .as_ref()
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.credentials.clone())
    }

    fn fill_cache(&self, credentials: &Credentials, generation: u64) {
        if let Ok(mut guard) = self.cache.lock() {
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("ai key changed during lookup, result not cached");
                return;
            }
            *guard = Some(CachedKey {
                credentials: credentials.clone(),
                expires_at: Instant::now() + self.ttl,
            });
        }
    }
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/** \brief 共享内容表中保存 AI 配置的固定 section 名。 */
pub const AI_CONFIG_SECTION: &str = "ai_config";

/** \brief 默认 Provider。 */
pub const DEFAULT_PROVIDER: &str = "gemini";

/** \brief 默认模型名。 */
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/**
 * \brief 规范化后的消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /**
     * \brief 宽松解析角色字符串（忽略大小写与首尾空白），未知角色返回 None。
     */
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/**
 * \brief 消息结构：system/user/assistant 三种角色之一加正文。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色 */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/**
 * \brief AI 配置记录，以 JSON 文档形式存放在共享内容表 `ai_config` 行中。
 * \details 未识别的字段保存在 `extra` 中，合并写回时原样保留。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /** \brief `iv.ciphertext` 形式的 base64 密文 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/**
 * \brief 当前生效密钥的来源。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Env,
    Store,
    None,
}

/**
 * \brief 管理端可见的配置摘要，绝不包含明文或密文。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigSummary {
    pub provider: String,
    pub model: String,
    pub key_preview: Option<String>,
    pub updated_at: Option<String>,
    pub updated_by: Option<String>,
    pub source: KeySource,
}

/**
 * \brief 管理员写入请求：三个字段均可选。
 */
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigUpdate {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/**
 * \brief 由 bearer token 解析出的已认证主体。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
}

impl Principal {
    /** \brief 审计字段使用的显示名：优先邮箱，否则用户 ID。 */
    pub fn audit_name(&self) -> String {
        self.email.clone().unwrap_or_else(|| self.id.clone())
    }
}

/**
 * \brief 笔记助手调用记录。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user_id: String,
    pub note_id: Option<String>,
    pub action: String,
    pub prompt_chars: i64,
    pub response_chars: i64,
    pub succeeded: bool,
    pub created_at: String,
}

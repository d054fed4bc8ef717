use anyhow::Result;
use async_trait::async_trait;

use crate::models::{AiConfigRecord, InteractionRecord, Principal};

/**
 * \brief 共享内容存储接口：AI 配置行与调用记录。
 * \details 由处理器显式注入，本地实现见 `db`，托管实现见 `remote`。
 */
#[async_trait]
pub trait ContentStore: Send + Sync {
    /** \brief 读取 `ai_config` 行，不存在时返回 None。 */
    async fn load_ai_config(&self) -> Result<Option<AiConfigRecord>>;

    /** \brief 单行 upsert 整个配置文档。 */
    async fn save_ai_config(&self, record: &AiConfigRecord) -> Result<()>;

    /** \brief 追加一条笔记助手调用记录。 */
    async fn record_interaction(&self, record: &InteractionRecord) -> Result<()>;
}

/**
 * \brief 身份服务接口：token 到主体的映射，以及角色表查询。
 */
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /** \brief token 无效或已失效时返回 Ok(None)。 */
    async fn resolve_principal(&self, token: &str) -> Result<Option<Principal>>;

    /** \brief 角色表中该用户的全部角色。 */
    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>>;
}

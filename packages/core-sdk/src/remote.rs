use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::RemoteStoreConfig;
use crate::models::{AiConfigRecord, InteractionRecord, Principal, AI_CONFIG_SECTION};
use crate::store::{ContentStore, IdentityProvider};
use crate::telemetry;

/**
 * \brief 托管数据库服务的 REST 客户端（表接口位于 `/rest/v1`，身份接口位于 `/auth/v1`）。
 * \details 使用服务端凭据访问，凭据只存在于服务端进程。
 */
pub struct RemoteStore {
    base: String,
    service_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ContentRow {
    content: Value,
}

#[derive(Deserialize)]
struct RoleRow {
    role: String,
}

impl RemoteStore {
    pub fn new(config: &RemoteStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self {
            base: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base, table)
    }

    fn service_request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.service_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Err(anyhow!("{} failed: {} -> {}", what, status, text))
    }
}

#[async_trait]
impl ContentStore for RemoteStore {
    async fn load_ai_config(&self) -> Result<Option<AiConfigRecord>> {
        let resp = self
            .service_request(reqwest::Method::GET, self.table_url("site_content"))
            .query(&[
                ("section", format!("eq.{}", AI_CONFIG_SECTION)),
                ("select", "content".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<ContentRow> = Self::expect_success(resp, "load ai_config")
            .await?
            .json()
            .await?;
        match rows.into_iter().next() {
            Some(row) if !row.content.is_null() => Ok(Some(
                serde_json::from_value(row.content).context("ai_config row has unexpected shape")?,
            )),
            _ => Ok(None),
        }
    }

    async fn save_ai_config(&self, record: &AiConfigRecord) -> Result<()> {
        let body = json!({
            "section": AI_CONFIG_SECTION,
            "content": record,
            "updated_at": telemetry::now_rfc3339(),
        });
        let resp = self
            .service_request(reqwest::Method::POST, self.table_url("site_content"))
            .query(&[("on_conflict", "section")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        Self::expect_success(resp, "save ai_config").await?;
        Ok(())
    }

    async fn record_interaction(&self, record: &InteractionRecord) -> Result<()> {
        let resp = self
            .service_request(reqwest::Method::POST, self.table_url("ai_interactions"))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        Self::expect_success(resp, "record interaction").await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for RemoteStore {
    async fn resolve_principal(&self, token: &str) -> Result<Option<Principal>> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.base))
            .header("apikey", &self.service_key)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        if matches!(
            resp.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            return Ok(None);
        }
        let user: Principal = Self::expect_success(resp, "resolve user")
            .await?
            .json()
            .await?;
        if user.id.is_empty() {
            return Ok(None);
        }
        Ok(Some(user))
    }

    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        let resp = self
            .service_request(reqwest::Method::GET, self.table_url("user_roles"))
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("select", "role".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<RoleRow> = Self::expect_success(resp, "load user roles")
            .await?
            .json()
            .await?;
        Ok(rows.into_iter().map(|r| r.role).collect())
    }
}

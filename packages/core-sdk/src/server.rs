use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    assistant::{self, NoteAssistantRequest},
    auth,
    config::ServerConfig,
    db::SqliteStore,
    errors::ApiError,
    llm::{GeminiClient, GenerationOptions},
    models::{AiConfigSummary, AiConfigUpdate, InteractionRecord},
    normalize::{self, ChatPayload},
    remote::RemoteStore,
    secrets::SecretResolver,
    store::{ContentStore, IdentityProvider},
    telemetry,
};

/**
 * \brief 处理器共享状态：存储、身份服务、密钥解析器与上游客户端均显式注入。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContentStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub secrets: Arc<SecretResolver>,
    pub upstream: GeminiClient,
}

impl AppState {
    /**
     * \brief 按配置组装状态：配置了远端存储则使用远端，否则打开本地 SQLite。
     */
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let (store, identity): (Arc<dyn ContentStore>, Arc<dyn IdentityProvider>) =
            match &config.remote_store {
                Some(remote) => {
                    let client = Arc::new(RemoteStore::new(remote)?);
                    let store: Arc<dyn ContentStore> = client.clone();
                    let identity: Arc<dyn IdentityProvider> = client;
                    (store, identity)
                }
                None => {
                    let local = Arc::new(SqliteStore::open(&config.db_path)?);
                    let store: Arc<dyn ContentStore> = local.clone();
                    let identity: Arc<dyn IdentityProvider> = local;
                    (store, identity)
                }
            };
        let secrets = SecretResolver::new(
            store.clone(),
            config.env_api_key.clone(),
            config.encryption_secret.as_deref(),
        )
        .with_default_model(config.ai_model.clone());
        Ok(Self {
            store,
            identity,
            secrets: Arc::new(secrets),
            upstream: GeminiClient::new(&config.upstream_base, config.upstream_timeout)?,
        })
    }
}

/**
 * \brief 启动 HTTP 服务，提供 API 与静态站点。
 * \param addr 监听地址，如 "127.0.0.1:8787"
 */
pub async fn run(config: ServerConfig, addr: &str) -> Result<()> {
    let state = AppState::from_config(&config)?;
    if config.encryption_secret.is_none() {
        tracing::warn!("STUDYDESK_AI_CONFIG_SECRET is not set; admin key updates will fail");
    }

    let site_root = if std::path::Path::new(&config.site_dir).exists() {
        config.site_dir.clone()
    } else {
        config.site_fallback.clone()
    };
    let static_service =
        get_service(ServeDir::new(site_root).append_index_html_on_directories(true));

    let app = api_router(state)
        .fallback_service(static_service)
        .layer(TimeoutLayer::new(config.upstream_timeout + Duration::from_secs(5)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由（不含静态站点与中间件）。
 */
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/admin/ai-config",
            get(get_ai_config)
                .post(save_ai_config)
                .put(save_ai_config)
                .patch(save_ai_config),
        )
        .route("/api/chat", post(chat))
        .route("/api/note-assistant", post(note_assistant))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Serialize, Debug)]
struct ConfigResponse {
    config: AiConfigSummary,
}

#[derive(Serialize, Debug)]
struct ChatResponse {
    reply: String,
}

#[derive(Serialize, Debug)]
struct NoteAssistantResponse {
    response: String,
}

/**
 * \brief 读取 AI 配置摘要（仅管理员）。
 */
async fn get_ai_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConfigResponse>, ApiError> {
    auth::require_admin(state.identity.as_ref(), &headers).await?;
    let config = state.secrets.summary().await?;
    Ok(Json(ConfigResponse { config }))
}

/**
 * \brief 更新 AI 配置（仅管理员），支持 POST/PUT/PATCH。
 */
async fn save_ai_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AiConfigUpdate>, JsonRejection>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let admin = auth::require_admin(state.identity.as_ref(), &headers).await?;
    let Json(update) = payload?;
    let config = state.secrets.save_config(update, &admin).await?;
    Ok(Json(ConfigResponse { config }))
}

/**
 * \brief 通用聊天代理：规范化 → 解析密钥 → 调用上游。
 */
async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(payload) = payload?;
    let request = normalize::build_chat_request(&payload)?;
    let credentials = state.secrets.require().await?;
    let options = GenerationOptions::default().with_temperature(payload.temperature);

    let reply = state
        .upstream
        .generate(&credentials.api_key, &credentials.model, &request, options)
        .await
        .map_err(|err| {
            telemetry::log_error(
                "server.chat",
                &format!("model={} upstream={}", credentials.model, err),
            );
            err
        })?;
    telemetry::log_event(
        "server.chat",
        &format!(
            "model={} turns={} reply_len={}",
            credentials.model,
            request.turns.len(),
            reply.len()
        ),
    );
    Ok(Json(ChatResponse { reply }))
}

/**
 * \brief 笔记助手：任何已认证用户可用，每次调用（含被拒绝的请求）都写入调用记录。
 */
async fn note_assistant(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NoteAssistantRequest>, JsonRejection>,
) -> Result<Json<NoteAssistantResponse>, ApiError> {
    let principal = auth::authenticate(state.identity.as_ref(), &headers).await?;

    let mut record = InteractionRecord {
        user_id: principal.id.clone(),
        note_id: None,
        action: assistant::UNPARSED_ACTION.to_string(),
        prompt_chars: 0,
        response_chars: 0,
        succeeded: false,
        created_at: telemetry::now_rfc3339(),
    };
    let outcome = run_note_assistant(&state, payload, &mut record).await;
    record.succeeded = outcome.is_ok();
    if let Ok(response) = &outcome {
        record.response_chars = response.chars().count() as i64;
    }
    if let Err(err) = state.store.record_interaction(&record).await {
        telemetry::log_error(
            "server.note_assistant",
            &format!("interaction log failed for {}: {:#}", principal.id, err),
        );
    }

    let response = outcome?;
    Ok(Json(NoteAssistantResponse { response }))
}

/**
 * \brief 解析、校验并调用上游；边执行边把已知信息填入调用记录。
 */
async fn run_note_assistant(
    state: &AppState,
    payload: Result<Json<NoteAssistantRequest>, JsonRejection>,
    record: &mut InteractionRecord,
) -> Result<String, ApiError> {
    let Json(req) = payload?;
    record.note_id = req.note_id_string();
    record.action = req.action.as_str().to_string();

    let messages = assistant::build_messages(&req)?;
    record.prompt_chars = messages
        .iter()
        .map(|m| m.content.chars().count() as i64)
        .sum();
    let request = normalize::split_messages(&messages);

    let credentials = state.secrets.require().await?;
    let options =
        GenerationOptions::default().with_max_output_tokens(req.action.max_output_tokens());
    let reply = state
        .upstream
        .generate(&credentials.api_key, &credentials.model, &request, options)
        .await?;
    Ok(assistant::shape_response(req.action, &reply))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let key_configured = state.secrets.resolve().await.is_some();
    Json(serde_json::json!({ "ok": true, "keyConfigured": key_configured }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::errors::{RATE_LIMITED_MESSAGE, UPSTREAM_UNAVAILABLE_MESSAGE};
    use crate::llm::tests::{reply_body, spawn_upstream};
    use crate::models::Principal;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "test-config-secret";

    struct Harness {
        store: Arc<SqliteStore>,
        app: Router,
    }

    async fn harness(upstream_status: u16, upstream_body: Value, env_key: Option<&str>) -> Harness {
        let mock = spawn_upstream(upstream_status, upstream_body).await;
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store
            .with_conn(|conn| {
                db::insert_token(
                    conn,
                    "student-token",
                    &Principal {
                        id: "student".into(),
                        email: Some("student@example.com".into()),
                        ..Default::default()
                    },
                )?;
                db::insert_token(
                    conn,
                    "admin-token",
                    &Principal {
                        id: "admin".into(),
                        email: Some("admin@example.com".into()),
                        ..Default::default()
                    },
                )?;
                db::grant_role(conn, "admin", "admin")
            })
            .expect("seed");

        let secrets = SecretResolver::new(store.clone(), env_key.map(str::to_string), Some(SECRET));
        let state = AppState {
            store: store.clone(),
            identity: store.clone(),
            secrets: Arc::new(secrets),
            upstream: GeminiClient::new(&mock.base, Duration::from_secs(5)).expect("client"),
        };
        Harness {
            store,
            app: api_router(state),
        }
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {}", t));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn chat_hello(app: &Router) -> (StatusCode, Value) {
        send(app, "POST", "/api/chat", None, Some(json!({"message": "hello"}))).await
    }

    fn interactions(store: &SqliteStore, user_id: &str) -> Vec<InteractionRecord> {
        store
            .with_conn(|conn| db::list_interactions(conn, user_id))
            .expect("interactions")
    }

    #[tokio::test]
    async fn test_chat_single_message() {
        let h = harness(200, reply_body(&["Hi!"]), Some("env-key")).await;
        let (status, body) = chat_hello(&h.app).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"reply": "Hi!"}));
    }

    #[tokio::test]
    async fn test_chat_rate_limited() {
        let h = harness(429, json!({"error": {"message": "quota"}}), Some("env-key")).await;
        let (status, body) = chat_hello(&h.app).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, json!({"error": RATE_LIMITED_MESSAGE}));
    }

    #[tokio::test]
    async fn test_chat_upstream_error_is_not_echoed() {
        let upstream_error = json!({"error": {"message": "internal provider detail"}});
        let h = harness(500, upstream_error, Some("env-key")).await;
        let (status, body) = chat_hello(&h.app).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("provider detail"));
        assert_eq!(body["error"], UPSTREAM_UNAVAILABLE_MESSAGE);
    }

    #[tokio::test]
    async fn test_chat_invalid_messages_is_400() {
        let h = harness(200, reply_body(&["x"]), Some("env-key")).await;
        let (status, body) = send(
            &h.app,
            "POST",
            "/api/chat",
            None,
            Some(json!({"messages": [
                {"role": "robot", "content": "x"},
                {"role": "user", "content": 1}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&h.app, "POST", "/api/chat", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_without_key_is_configuration_error() {
        let h = harness(200, reply_body(&["x"]), None).await;
        let (status, body) = chat_hello(&h.app).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "AI API key is not configured");
    }

    #[tokio::test]
    async fn test_config_requires_admin() {
        let h = harness(200, reply_body(&["x"]), None).await;
        let (status, body) = send(&h.app, "GET", "/api/admin/ai-config", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let (status, body) =
            send(&h.app, "GET", "/api/admin/ai-config", Some("student-token"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Forbidden");
    }

    #[tokio::test]
    async fn test_admin_saves_key_then_chat_uses_it() {
        let h = harness(200, reply_body(&["stored key works"]), None).await;
        let (status, body) = send(
            &h.app,
            "POST",
            "/api/admin/ai-config",
            Some("admin-token"),
            Some(json!({"apiKey": "abcd1234efgh"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["config"]["keyPreview"], "abcd…efgh");
        assert_eq!(body["config"]["updatedBy"], "admin@example.com");
        assert_eq!(body["config"]["source"], "store");
        assert!(body["config"].get("encryptedKey").is_none());

        let stored = h.store.load_ai_config().await.expect("load").expect("row");
        assert_ne!(stored.encrypted_key.as_deref(), Some("abcd1234efgh"));
        assert_eq!(stored.key_preview.as_deref(), Some("abcd…efgh"));

        let (status, body) =
            send(&h.app, "GET", "/api/admin/ai-config", Some("admin-token"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["config"]["keyPreview"], "abcd…efgh");

        let (status, body) = chat_hello(&h.app).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "stored key works");
    }

    #[tokio::test]
    async fn test_config_patch_without_key_when_none_stored_is_400() {
        let h = harness(200, reply_body(&["x"]), None).await;
        let (status, _) = send(
            &h.app,
            "PATCH",
            "/api/admin/ai-config",
            Some("admin-token"),
            Some(json!({"model": "gemini-1.5-pro"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_note_assistant_flashcards_logs_interaction() {
        let cards = r#"[{"front": "ATP", "back": "energy currency"}]"#;
        let h = harness(200, reply_body(&[cards]), Some("env-key")).await;
        let (status, body) = send(
            &h.app,
            "POST",
            "/api/note-assistant",
            Some("student-token"),
            Some(json!({"noteId": "n1", "noteContent": "Cells use ATP.", "action": "flashcards"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = body["response"].as_str().expect("string");
        let parsed: Value = serde_json::from_str(text).expect("json");
        assert_eq!(parsed[0]["front"], "ATP");

        let rows = interactions(&h.store, "student");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "flashcards");
        assert_eq!(rows[0].note_id.as_deref(), Some("n1"));
        assert!(rows[0].succeeded);
    }

    #[tokio::test]
    async fn test_note_assistant_requires_token_and_logs_failures() {
        let h = harness(429, json!({}), Some("env-key")).await;
        let payload = json!({"noteContent": "Cells", "action": "summarize"});
        let (status, _) =
            send(&h.app, "POST", "/api/note-assistant", None, Some(payload.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = Some("student-token");
        let (status, _) = send(&h.app, "POST", "/api/note-assistant", token, Some(payload)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let rows = interactions(&h.store, "student");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].succeeded);
    }

    #[tokio::test]
    async fn test_note_assistant_logs_rejected_requests() {
        let h = harness(200, reply_body(&["unused"]), Some("env-key")).await;
        let token = Some("student-token");

        let qa_without_question = json!({"noteId": 7, "noteContent": "Cells", "action": "qa"});
        let (status, _) =
            send(&h.app, "POST", "/api/note-assistant", token, Some(qa_without_question)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown_action = json!({"noteContent": "Cells", "action": "translate"});
        let (status, _) =
            send(&h.app, "POST", "/api/note-assistant", token, Some(unknown_action)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let rows = interactions(&h.store, "student");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "qa");
        assert_eq!(rows[0].note_id.as_deref(), Some("7"));
        assert!(!rows[0].succeeded);
        assert_eq!(rows[1].action, assistant::UNPARSED_ACTION);
        assert!(!rows[1].succeeded);
        assert_eq!(rows[1].response_chars, 0);
    }

    #[tokio::test]
    async fn test_health_reports_key_state() {
        let h = harness(200, reply_body(&["x"]), None).await;
        let (status, body) = send(&h.app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keyConfigured"], false);
    }
}

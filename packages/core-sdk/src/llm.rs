use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::errors::UpstreamError;
use crate::normalize::ChatRequest;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;
pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't generate a response. Please try again.";

/**
 * \brief 单次生成参数。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl GenerationOptions {
    /**
     * \brief 以客户端传入的温度覆盖默认值，非有限值忽略，其余截断到 [0, 2]。
     */
    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        if let Some(t) = temperature.filter(|t| t.is_finite()) {
            self.temperature = t.clamp(0.0, 2.0);
        }
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}

/**
 * \brief 生成式语言 API 客户端（generateContent 接口）。
 */
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base: String,
    client: reqwest::Client,
}

impl GeminiClient {
    /**
     * \brief 创建带显式连接与请求超时的客户端。
     */
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base: normalize_gemini_base(api_base),
            client,
        })
    }

    /**
     * \brief 非流式调用，返回完整回复；429 单独区分，其余失败统一为不可用。
     * \details 上游错误正文只写入服务端日志，不返回给调用方。
     */
    pub async fn generate(
        &self,
        api_key: &str,
        model: &str,
        request: &ChatRequest,
        options: GenerationOptions,
    ) -> Result<String, UpstreamError> {
        let url = format!("{}/models/{}:generateContent", self.base, model);
        let body = gemini_payload(request, options);

        let resp = self
            .client
            .post(url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(model, "gemini transport error: {}", e.without_url());
                UpstreamError::Unavailable
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(model, "gemini rate limited");
            return Err(UpstreamError::RateLimited);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(model, %status, "gemini request failed: {}", text);
            return Err(UpstreamError::Unavailable);
        }

        let v: Value = resp.json().await.map_err(|e| {
            tracing::error!(model, "gemini returned unreadable body: {}", e.without_url());
            UpstreamError::Unavailable
        })?;
        let text = extract_gemini_content(&v);
        if text.trim().is_empty() {
            tracing::warn!(model, "gemini returned no text, using fallback reply");
            Ok(FALLBACK_REPLY.to_string())
        } else {
            Ok(text)
        }
    }
}

fn gemini_payload(request: &ChatRequest, options: GenerationOptions) -> Value {
    let contents: Vec<Value> = request
        .turns
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role,
                "parts": [{"text": turn.text}]
            })
        })
        .collect();
    json!({
        "system_instruction": {
            "parts": [{"text": request.system_instruction}]
        },
        "contents": contents,
        "generationConfig": {
            "temperature": options.temperature,
            "maxOutputTokens": options.max_output_tokens,
        }
    })
}

fn extract_gemini_content(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|candidates| candidates.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalize::{Turn, TurnRole};
    use axum::{
        extract::{Path, Query},
        http::StatusCode as AxumStatus,
        routing::post,
        Json, Router,
    };
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    /**
     * \brief 进程内上游桩：按固定状态码与正文响应，并记录最近一次请求体。
     */
    pub(crate) struct MockUpstream {
        pub base: String,
        pub last_body: Arc<Mutex<Option<Value>>>,
    }

    pub(crate) async fn spawn_upstream(status: u16, body: Value) -> MockUpstream {
        let last_body = Arc::new(Mutex::new(None));
        let captured = last_body.clone();
        let handler = move |Path(_model): Path<String>,
                            Query(q): Query<HashMap<String, String>>,
                            Json(req): Json<Value>| {
            let captured = captured.clone();
            let body = body.clone();
            async move {
                let mut req = req;
                req["_key"] = json!(q.get("key").cloned().unwrap_or_default());
                *captured.lock().unwrap() = Some(req);
                (AxumStatus::from_u16(status).unwrap(), Json(body))
            }
        };
        let app = Router::new().route("/v1beta/models/{model}", post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        MockUpstream {
            base: format!("http://{}", addr),
            last_body,
        }
    }

    pub(crate) fn reply_body(parts: &[&str]) -> Value {
        let parts: Vec<Value> = parts.iter().map(|t| json!({"text": t})).collect();
        json!({"candidates": [{"content": {"role": "model", "parts": parts}}]})
    }

    fn request() -> ChatRequest {
        ChatRequest {
            system_instruction: "sys".into(),
            turns: vec![
                Turn {
                    role: TurnRole::User,
                    text: "hi".into(),
                },
                Turn {
                    role: TurnRole::Model,
                    text: "hello".into(),
                },
                Turn {
                    role: TurnRole::User,
                    text: "again".into(),
                },
            ],
        }
    }

    fn client(base: &str) -> GeminiClient {
        GeminiClient::new(base, Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_gemini_base("https://x.dev/"), "https://x.dev/v1beta");
        assert_eq!(normalize_gemini_base("https://x.dev/v1"), "https://x.dev/v1");
        assert_eq!(
            normalize_gemini_base("https://x.dev/v1beta/"),
            "https://x.dev/v1beta"
        );
    }

    #[test]
    fn test_temperature_override() {
        let o = GenerationOptions::default();
        assert_eq!(o.with_temperature(None).temperature, DEFAULT_TEMPERATURE);
        assert_eq!(o.with_temperature(Some(5.0)).temperature, 2.0);
        assert_eq!(o.with_temperature(Some(-1.0)).temperature, 0.0);
        assert_eq!(o.with_temperature(Some(f64::NAN)).temperature, DEFAULT_TEMPERATURE);
        assert_eq!(o.with_temperature(Some(0.2)).temperature, 0.2);
    }

    #[test]
    fn test_extract_joins_first_candidate_parts() {
        let v = json!({"candidates": [
            {"content": {"parts": [{"text": "Hel"}, {"inline": 1}, {"text": "lo"}]}},
            {"content": {"parts": [{"text": "other"}]}}
        ]});
        assert_eq!(extract_gemini_content(&v), "Hello");
        assert_eq!(extract_gemini_content(&json!({})), "");
    }

    #[tokio::test]
    async fn test_generate_success_sends_mapped_payload() {
        let mock = spawn_upstream(200, reply_body(&["Hi", "!"])).await;
        let reply = client(&mock.base)
            .generate("k-1", "gemini-1.5-flash", &request(), GenerationOptions::default())
            .await
            .expect("reply");
        assert_eq!(reply, "Hi!");

        let sent = mock.last_body.lock().unwrap().clone().expect("captured");
        assert_eq!(sent["_key"], "k-1");
        assert_eq!(sent["system_instruction"]["parts"][0]["text"], "sys");
        assert_eq!(sent["contents"][1]["role"], "model");
        assert_eq!(sent["contents"].as_array().unwrap().len(), 3);
        assert_eq!(sent["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[tokio::test]
    async fn test_generate_empty_reply_falls_back() {
        let mock = spawn_upstream(200, json!({"candidates": []})).await;
        let reply = client(&mock.base)
            .generate("k", "m", &request(), GenerationOptions::default())
            .await
            .expect("reply");
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_generate_error_mapping() {
        let limited = spawn_upstream(429, json!({"error": {"message": "quota"}})).await;
        let err = client(&limited.base)
            .generate("k", "m", &request(), GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::RateLimited);

        let broken = spawn_upstream(400, json!({"error": {"message": "API key not valid"}})).await;
        let err = client(&broken.base)
            .generate("k", "m", &request(), GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::Unavailable);
    }

    #[tokio::test]
    async fn test_generate_unreachable_is_unavailable() {
        let err = client("http://127.0.0.1:9")
            .generate("k", "m", &request(), GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::Unavailable);
    }
}

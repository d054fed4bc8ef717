use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";
pub const UPSTREAM_UNAVAILABLE_MESSAGE: &str = "AI service is temporarily unavailable.";
pub const KEY_NOT_CONFIGURED_MESSAGE: &str = "AI API key is not configured";

/**
 * \brief HTTP 边界错误分类。
 * \details 解密失败不在此列：它在密钥解析器内部降级为“未配置”。
 */
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthenticated,
    #[error("Forbidden")]
    Forbidden,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Configuration(String),
    #[error("Rate limit exceeded. Please try again later.")]
    UpstreamRateLimited,
    #[error("AI service is temporarily unavailable.")]
    UpstreamUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ApiError::Configuration(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Configuration(_)
            | ApiError::UpstreamUnavailable
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited => ApiError::UpstreamRateLimited,
            UpstreamError::Unavailable => ApiError::UpstreamUnavailable,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!(error = %format!("{:#}", err), "unhandled error");
                err.root_cause().to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/**
 * \brief 上游生成式 API 调用失败的对外可见分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream rate limited")]
    RateLimited,
    #[error("upstream unavailable")]
    Unavailable,
}

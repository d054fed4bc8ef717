use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde_json::{Map, Value};

use crate::errors::ApiError;
use crate::models::Principal;
use crate::store::IdentityProvider;

/**
 * \brief 主体能力。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Admin,
}

impl Capability {
    fn role_name(self) -> &'static str {
        match self {
            Capability::Admin => "admin",
        }
    }
}

/**
 * \brief 从 `Authorization` 头中提取 bearer token（scheme 不区分大小写）。
 */
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/**
 * \brief 解析请求的已认证主体；缺少 token 或 token 无效均视为未认证。
 */
pub async fn authenticate(
    identity: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthenticated)?;
    match identity.resolve_principal(token).await {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => Err(ApiError::Unauthenticated),
        Err(err) => {
            tracing::warn!("identity lookup failed: {:#}", err);
            Err(ApiError::Unauthenticated)
        }
    }
}

/**
 * \brief 管理员闸门：认证后要求 Admin 能力，否则返回 403。
 */
pub async fn require_admin(
    identity: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let principal = authenticate(identity, headers).await?;
    let roles = match identity.user_roles(&principal.id).await {
        Ok(roles) => roles,
        Err(err) => {
            tracing::warn!(user = %principal.id, "role table lookup failed: {:#}", err);
            Vec::new()
        }
    };
    if has_capability(&principal, &roles, Capability::Admin) {
        Ok(principal)
    } else {
        tracing::info!(user = %principal.id, "admin capability denied");
        Err(ApiError::Forbidden)
    }
}

/**
 * \brief 统一的能力判断：角色表命中，或任一元数据标记命中即成立。
 * \details 元数据标记兼容三种历史形状：`role`、`is_admin`、`roles` 数组。
 */
pub fn has_capability(
    principal: &Principal,
    role_table: &[String],
    capability: Capability,
) -> bool {
    let name = capability.role_name();
    role_table.iter().any(|r| r.eq_ignore_ascii_case(name))
        || metadata_grants(&principal.user_metadata, name)
        || metadata_grants(&principal.app_metadata, name)
}

fn metadata_grants(meta: &Map<String, Value>, name: &str) -> bool {
    let role_hit = meta
        .get("role")
        .and_then(Value::as_str)
        .is_some_and(|r| r.eq_ignore_ascii_case(name));
    let flag_hit = meta
        .get(&format!("is_{}", name))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let claims_hit = meta
        .get("roles")
        .and_then(Value::as_array)
        .is_some_and(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .any(|r| r.eq_ignore_ascii_case(name))
        });
    role_hit || flag_hit || claims_hit
}

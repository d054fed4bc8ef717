use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ApiError;
use crate::models::{Message, Role};

/** \brief 所有上游请求共用的基础人设指令。 */
pub const BASELINE_PERSONA: &str =
    "You are StudyDesk, a friendly and knowledgeable study assistant for students. \
Explain concepts clearly, stay accurate, and keep answers focused on helping the student learn.";

/**
 * \brief 聊天接口的请求体：`message` 或 `messages` 二选一，`temperature` 可选。
 * \details 消息字段先按原始 JSON 接收，非法条目在规范化时静默丢弃。
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub messages: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/**
 * \brief 上游会话角色：assistant 映射为 model。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

/**
 * \brief 统一的上游聊天请求。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /** \brief 基础人设 + 全部 system 条目，以空行连接 */
    pub system_instruction: String,
    /** \brief 按原顺序排列的会话轮次，不含 system 条目 */
    pub turns: Vec<Turn>,
}

/**
 * \brief 将客户端载荷规范化为有序消息列表。
 * \details `messages` 优先；仅当它规范化后为空时才使用 `message`。
 */
pub fn normalize_messages(payload: &ChatPayload) -> Vec<Message> {
    let mut out: Vec<Message> = payload
        .messages
        .as_ref()
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(normalize_entry).collect())
        .unwrap_or_default();

    if out.is_empty() {
        if let Some(text) = payload.message.as_ref().and_then(Value::as_str) {
            if !text.trim().is_empty() {
                out.push(Message::user(text));
            }
        }
    }
    out
}

fn normalize_entry(item: &Value) -> Option<Message> {
    let role = Role::parse(item.get("role")?.as_str()?)?;
    let content = item.get("content")?.as_str()?;
    if content.trim().is_empty() {
        return None;
    }
    Some(Message {
        role,
        content: content.to_string(),
    })
}

/**
 * \brief 拆分为 system 指令与会话轮次。
 */
pub fn split_messages(messages: &[Message]) -> ChatRequest {
    let mut system_parts = vec![BASELINE_PERSONA.to_string()];
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::User => turns.push(Turn {
                role: TurnRole::User,
                text: msg.content.clone(),
            }),
            Role::Assistant => turns.push(Turn {
                role: TurnRole::Model,
                text: msg.content.clone(),
            }),
        }
    }
    ChatRequest {
        system_instruction: system_parts.join("\n\n"),
        turns,
    }
}

/**
 * \brief 规范化并拆分；没有任何可发送的会话轮次时返回 400。
 */
pub fn build_chat_request(payload: &ChatPayload) -> Result<ChatRequest, ApiError> {
    let messages = normalize_messages(payload);
    let request = split_messages(&messages);
    if request.turns.is_empty() {
        return Err(ApiError::validation("Message is required"));
    }
    Ok(request)
}

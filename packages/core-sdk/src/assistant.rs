use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ApiError;
use crate::models::Message;

/** \brief 送入模型前笔记正文的最大字符数。 */
pub const MAX_NOTE_CHARS: usize = 12_000;

/** \brief 请求体无法解析、动作未知时调用记录中使用的动作名。 */
pub const UNPARSED_ACTION: &str = "invalid";

/** \brief 每道测验题的选项数。 */
pub const QUIZ_OPTIONS: usize = 4;

const SUMMARIZE_INSTRUCTION: &str = "Summarize the student's note below. \
Use short sections with bullet points, keep every key term, \
and finish with a one-sentence takeaway.";

const FLASHCARDS_INSTRUCTION: &str = "Create 8 to 12 flashcards from the student's note below. \
Respond with ONLY a JSON array of objects with string fields \"front\" and \"back\".";

const QUIZ_INSTRUCTION: &str = "Create a 5-question multiple-choice quiz \
from the student's note below. Respond with ONLY a JSON array of objects with fields \
\"question\" (string), \"options\" (array of exactly 4 strings) \
and \"answer\" (the correct option text).";

/**
 * \brief 笔记助手动作。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteAction {
    Summarize,
    Flashcards,
    Qa,
    Explain,
    Quiz,
}

impl NoteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteAction::Summarize => "summarize",
            NoteAction::Flashcards => "flashcards",
            NoteAction::Qa => "qa",
            NoteAction::Explain => "explain",
            NoteAction::Quiz => "quiz",
        }
    }

    /** \brief 该动作的回复是否为结构化 JSON 数组。 */
    pub fn is_structured(self) -> bool {
        matches!(self, NoteAction::Flashcards | NoteAction::Quiz)
    }

    /** \brief 结构化动作需要更大的输出上限。 */
    pub fn max_output_tokens(self) -> u32 {
        if self.is_structured() {
            2048
        } else {
            1024
        }
    }
}

/**
 * \brief 笔记助手请求体。
 */
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteAssistantRequest {
    #[serde(default)]
    pub note_id: Option<Value>,
    #[serde(default)]
    pub note_content: Option<String>,
    pub action: NoteAction,
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub existing_content: Option<Value>,
}

impl NoteAssistantRequest {
    /** \brief noteId 可能是字符串或数字，统一为字符串。 */
    pub fn note_id_string(&self) -> Option<String> {
        match self.note_id.as_ref()? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
}

/**
 * \brief 校验请求并构造发往模型的消息列表。
 */
pub fn build_messages(req: &NoteAssistantRequest) -> Result<Vec<Message>, ApiError> {
    let note = req
        .note_content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::validation("Note content is required"))?;
    let note = truncate_chars(note, MAX_NOTE_CHARS);
    let user_input = req
        .user_input
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let instruction = match req.action {
        NoteAction::Summarize => SUMMARIZE_INSTRUCTION.to_string(),
        NoteAction::Explain => {
            let focus = user_input
                .map(|q| format!(" Focus on: {}.", q))
                .unwrap_or_default();
            format!(
                "Explain the concepts in the student's note below in simple language, \
with one concrete example per concept.{}",
                focus
            )
        }
        NoteAction::Qa => {
            let question =
                user_input.ok_or_else(|| ApiError::validation("A question is required"))?;
            format!(
                "Answer the student's question using the note below as the primary source. \
If the note does not cover it, say so before answering from general knowledge.\n\nQuestion: {}",
                question
            )
        }
        NoteAction::Flashcards => FLASHCARDS_INSTRUCTION.to_string(),
        NoteAction::Quiz => QUIZ_INSTRUCTION.to_string(),
    };

    let mut messages = vec![Message::system(instruction)];
    if req.refresh && req.action.is_structured() {
        if let Some(existing) = existing_summary(req.existing_content.as_ref()) {
            messages.push(Message::system(format!(
                "Generate a fresh set. Do not repeat any of these existing items:\n{}",
                existing
            )));
        }
    }
    messages.push(Message::user(format!("Note:\n{}", note)));
    Ok(messages)
}

/**
 * \brief 整理模型回复：结构化动作返回 JSON 字符串，解析失败时回退为原文。
 */
pub fn shape_response(action: NoteAction, reply: &str) -> String {
    match action {
        NoteAction::Flashcards => parse_items::<Flashcard>(reply)
            .filter(|cards| !cards.is_empty())
            .and_then(|cards| serde_json::to_string(&cards).ok()),
        NoteAction::Quiz => parse_items::<QuizQuestion>(reply)
            .map(|qs| {
                qs.into_iter()
                    .filter(|q| {
                        q.options.len() == QUIZ_OPTIONS && q.options.contains(&q.answer)
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|qs| !qs.is_empty())
            .and_then(|qs| serde_json::to_string(&qs).ok()),
        _ => None,
    }
    .unwrap_or_else(|| reply.trim().to_string())
}

fn parse_items<T: for<'de> Deserialize<'de>>(reply: &str) -> Option<Vec<T>> {
    let body = strip_code_fence(reply.trim());
    if let Ok(items) = serde_json::from_str::<Vec<T>>(body) {
        return Some(items);
    }
    let start = body.find('[')?;
    let end = body.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<T>>(&body[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn existing_summary(existing: Option<&Value>) -> Option<String> {
    let text = match existing? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then(|| truncate_chars(&text, 4_000).to_string())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    fn request(v: Value) -> NoteAssistantRequest {
        serde_json::from_value(v).expect("request")
    }

    #[test]
    fn test_unknown_action_rejected_by_serde() {
        let r = serde_json::from_value::<NoteAssistantRequest>(
            json!({"noteContent": "x", "action": "translate"}),
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_blank_note_rejected() {
        let r = request(json!({"noteContent": "  ", "action": "summarize"}));
        assert!(matches!(build_messages(&r), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_qa_requires_question() {
        let r = request(json!({"noteContent": "cells", "action": "qa"}));
        assert!(build_messages(&r).is_err());

        let r = request(json!({
            "noteContent": "cells",
            "action": "qa",
            "userInput": "What is ATP?"
        }));
        let msgs = build_messages(&r).expect("messages");
        assert!(msgs[0].content.contains("What is ATP?"));
        assert_eq!(msgs.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_refresh_mentions_existing_items() {
        let r = request(json!({
            "noteContent": "photosynthesis",
            "action": "flashcards",
            "refresh": true,
            "existingContent": [{"front": "Chlorophyll", "back": "pigment"}]
        }));
        let msgs = build_messages(&r).expect("messages");
        assert_eq!(msgs.len(), 3);
        assert!(msgs[1].content.contains("Chlorophyll"));

        let r = request(json!({
            "noteContent": "x",
            "action": "summarize",
            "refresh": true,
            "existingContent": "old"
        }));
        assert_eq!(build_messages(&r).expect("messages").len(), 2);
    }

    #[test]
    fn test_note_is_truncated() {
        let long = "é".repeat(MAX_NOTE_CHARS + 50);
        let r = request(json!({"noteContent": long, "action": "summarize"}));
        let msgs = build_messages(&r).expect("messages");
        assert_eq!(msgs[1].content.chars().count(), "Note:\n".len() + MAX_NOTE_CHARS);
    }

    #[test]
    fn test_note_id_forms() {
        assert_eq!(
            request(json!({"noteId": 12, "action": "quiz"})).note_id_string().as_deref(),
            Some("12")
        );
        assert_eq!(
            request(json!({"noteId": "n-1", "action": "quiz"})).note_id_string().as_deref(),
            Some("n-1")
        );
        assert!(request(json!({"action": "quiz"})).note_id_string().is_none());
    }

    #[test]
    fn test_flashcards_from_fenced_reply() {
        let reply = "```json\n[{\"front\": \"ATP\", \"back\": \"energy currency\"}]\n```";
        let shaped = shape_response(NoteAction::Flashcards, reply);
        let cards: Vec<Flashcard> = serde_json::from_str(&shaped).expect("json");
        assert_eq!(cards[0].front, "ATP");
    }

    #[test]
    fn test_quiz_drops_inconsistent_questions() {
        let reply = r#"Here you go: [
            {"question": "Q1", "options": ["a", "b", "c", "d"], "answer": "b"},
            {"question": "Q2", "options": ["a", "b", "c", "d"], "answer": "z"},
            {"question": "Q3", "options": ["a", "b", "c"], "answer": "a"},
            {"question": "Q4", "options": ["a", "b", "c", "d", "e"], "answer": "e"}
        ] Good luck!"#;
        let shaped = shape_response(NoteAction::Quiz, reply);
        let qs: Vec<QuizQuestion> = serde_json::from_str(&shaped).expect("json");
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].question, "Q1");
    }

    #[test]
    fn test_unparseable_structured_reply_returned_raw() {
        assert_eq!(
            shape_response(NoteAction::Flashcards, " not json "),
            "not json"
        );
        assert_eq!(shape_response(NoteAction::Summarize, " text "), "text");
    }
}

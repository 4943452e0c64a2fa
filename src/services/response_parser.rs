//! 模型响应解析
//!
//! 从模型的原始回复中提取 JSON（兼容 ```json 代码块、前后夹杂说明文字的情况），
//! 并把每个条目校验为 [`ItemDraft`]。

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::ValidationError;
use crate::models::item::{is_choice_type, CHOICE_OPTION_COUNT};
use crate::models::{ContentKind, ItemDraft};
use crate::utils::logging::truncate_text;

fn fenced_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```").expect("fenced array regex"))
}

fn bare_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("bare array regex"))
}

fn fenced_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced object regex"))
}

fn bare_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("bare object regex"))
}

fn not_json(response: &str) -> ValidationError {
    ValidationError::NotJson {
        snippet: truncate_text(response.trim(), 80),
    }
}

fn locate<'a>(response: &'a str, fenced: &Regex, bare: &Regex) -> Option<&'a str> {
    let candidate = fenced
        .captures(response)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(response);
    bare.find(candidate).map(|m| m.as_str())
}

/// 提取 JSON 数组
pub fn extract_json_array(response: &str) -> Result<Vec<Value>, ValidationError> {
    let raw = locate(response, fenced_array_re(), bare_array_re()).ok_or_else(|| not_json(response))?;
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(ValidationError::UnexpectedShape("期望 JSON 数组".to_string())),
        Err(_) => Err(not_json(response)),
    }
}

/// 提取单个 JSON 对象
pub fn extract_json_object(response: &str) -> Result<Map<String, Value>, ValidationError> {
    let raw = locate(response, fenced_object_re(), bare_object_re()).ok_or_else(|| not_json(response))?;
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::UnexpectedShape("期望 JSON 对象".to_string())),
        Err(_) => Err(not_json(response)),
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(values) => Some(
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    }
}

fn options_field(map: &Map<String, Value>) -> Option<Vec<String>> {
    match map.get("options")? {
        Value::Array(values) => Some(
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::Object(entries) => Some(
            entries
                .iter()
                .map(|(label, v)| match v {
                    Value::String(s) => format!("{}. {}", label, s.trim()),
                    other => format!("{}. {}", label, other),
                })
                .collect(),
        ),
        _ => None,
    }
}

/// 校验单个条目
///
/// - question / answer 不能为空
/// - 练习题必须有 type
/// - 选择题必须恰好 4 个选项
pub fn validate_draft(value: &Value, kind: ContentKind) -> Result<ItemDraft, ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::UnexpectedShape("条目不是 JSON 对象".to_string()))?;

    let question = text_field(map, "question").unwrap_or_default();
    if question.is_empty() {
        return Err(ValidationError::EmptyField { field: "question" });
    }
    let answer = text_field(map, "answer").unwrap_or_default();
    if answer.is_empty() {
        return Err(ValidationError::EmptyField { field: "answer" });
    }

    let item_type = text_field(map, "type").filter(|t| !t.is_empty());
    if kind == ContentKind::Exercise && item_type.is_none() {
        return Err(ValidationError::MissingExerciseType);
    }

    let options = options_field(map);
    let is_choice = match item_type.as_deref() {
        Some(t) => is_choice_type(t),
        None => options.is_some(),
    };
    if is_choice {
        let actual = options.as_ref().map(Vec::len).unwrap_or(0);
        if actual != CHOICE_OPTION_COUNT {
            return Err(ValidationError::WrongOptionCount {
                expected: CHOICE_OPTION_COUNT,
                actual,
            });
        }
    }

    Ok(ItemDraft {
        item_type,
        question,
        options: if is_choice { options } else { None },
        answer,
        explanation: text_field(map, "explanation").filter(|e| !e.is_empty()),
    })
}

/// 解析并校验条目列表
///
/// 响应中完全找不到 JSON 数组时返回错误；单个条目不合法时丢弃，
/// 原因放在返回值的第二项里。
pub fn parse_drafts(
    response: &str,
    kind: ContentKind,
) -> Result<(Vec<ItemDraft>, Vec<ValidationError>), ValidationError> {
    let values = extract_json_array(response)?;
    let mut drafts = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    for value in &values {
        match validate_draft(value, kind) {
            Ok(draft) => drafts.push(draft),
            Err(e) => rejected.push(e),
        }
    }
    Ok((drafts, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_array_from_fenced_block() {
        let response = "好的，以下是结果：\n```json\n[{\"question\": \"q\", \"answer\": \"a\"}]\n```\n希望有帮助";
        let items = extract_json_array(response).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_extract_array_without_fence() {
        let response = "结果 [{\"question\": \"q\", \"answer\": \"a\"}, {\"question\": \"q2\", \"answer\": \"b\"}] 完毕";
        assert_eq!(extract_json_array(response).unwrap().len(), 2);
    }

    #[test]
    fn test_extract_array_rejects_non_json() {
        assert!(matches!(
            extract_json_array("抱歉，我无法完成这个请求。"),
            Err(ValidationError::NotJson { .. })
        ));
        assert!(extract_json_array("[这不是 JSON]").is_err());
    }

    #[test]
    fn test_extract_object() {
        let map = extract_json_object("修改如下：{\"question\": \"新题干\", \"answer\": \"B\"}").unwrap();
        assert_eq!(map.get("answer"), Some(&json!("B")));
        assert!(extract_json_object("没有对象").is_err());
    }

    #[test]
    fn test_validate_choice_requires_four_options() {
        let three = json!({"type": "choice", "question": "q", "options": ["A", "B", "C"], "answer": "A"});
        assert_eq!(
            validate_draft(&three, ContentKind::Exercise),
            Err(ValidationError::WrongOptionCount { expected: 4, actual: 3 })
        );

        let four = json!({"type": "choice", "question": "q", "options": ["A", "B", "C", "D"], "answer": "A"});
        let draft = validate_draft(&four, ContentKind::Exercise).unwrap();
        assert!(draft.is_choice());
    }

    #[test]
    fn test_validate_required_fields() {
        let missing_answer = json!({"question": "q", "answer": "  "});
        assert_eq!(
            validate_draft(&missing_answer, ContentKind::Qa),
            Err(ValidationError::EmptyField { field: "answer" })
        );

        let missing_type = json!({"question": "q", "answer": "a"});
        assert_eq!(
            validate_draft(&missing_type, ContentKind::Exercise),
            Err(ValidationError::MissingExerciseType)
        );

        let numeric = json!({"question": "1+1=?", "answer": 2});
        assert_eq!(validate_draft(&numeric, ContentKind::Qa).unwrap().answer, "2");
    }

    #[test]
    fn test_parse_drafts_drops_invalid_items() {
        let response = r#"[
            {"question": "什么是导数？", "answer": "函数的变化率"},
            {"question": "", "answer": "空题干"},
            "not an object"
        ]"#;
        let (drafts, rejected) = parse_drafts(response, ContentKind::Qa).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(rejected.len(), 2);
    }
}

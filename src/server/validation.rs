//! Chat-completion request validation.
//!
//! Bodies arrive as JSON or URL-encoded forms, so every field is first read
//! loosely (a form sends `"0.5"` where JSON sends `0.5`) and only then checked
//! and converted. All violations are collected, not just the first.

use serde::Deserialize;
use serde_json::Value;

use crate::config::MAX_OUTPUT_TOKENS;
use crate::error::FieldError;

const MIN_TEMPERATURE: f64 = 0.0;
const MAX_TEMPERATURE: f64 = 2.0;

/// A chat-completion body as received.
#[derive(Debug, Default, Deserialize)]
pub struct RawChatRequest {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub model: Option<Value>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<Value>,
    #[serde(default)]
    pub stream: Option<Value>,
    #[serde(default)]
    pub system_prompt: Option<Value>,
}

/// A chat-completion request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Trimmed and HTML-escaped, never empty.
    pub message: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub system_prompt: Option<String>,
}

impl RawChatRequest {
    pub fn validate(self) -> Result<ChatRequest, Vec<FieldError>> {
        let mut errors = Vec::new();

        let message = match self.message {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(escape_html(s.trim())),
            Some(Value::String(_)) => {
                errors.push(FieldError::new("message", "Message cannot be empty"));
                None
            }
            None => {
                errors.push(FieldError::new("message", "Message is required"));
                None
            }
            Some(_) => {
                errors.push(FieldError::new("message", "Message must be a string"));
                None
            }
        };

        let model = match self.model {
            None => None,
            Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Some(_) => {
                errors.push(FieldError::new("model", "Model must be a string"));
                None
            }
        };

        let temperature = match self.temperature.as_ref().map(as_f64) {
            None => None,
            Some(Some(t)) if (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&t) => Some(t),
            Some(_) => {
                errors.push(FieldError::new(
                    "temperature",
                    "Temperature must be between 0 and 2",
                ));
                None
            }
        };

        let max_tokens = match self.max_tokens.as_ref().map(as_i64) {
            None => None,
            Some(Some(n)) if (1..=i64::from(MAX_OUTPUT_TOKENS)).contains(&n) => {
                u32::try_from(n).ok()
            }
            Some(_) => {
                errors.push(FieldError::new(
                    "max_tokens",
                    format!("Max tokens must be between 1 and {MAX_OUTPUT_TOKENS}"),
                ));
                None
            }
        };

        let stream = match self.stream {
            None => false,
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) if s == "true" || s == "1" => true,
            Some(Value::String(s)) if s == "false" || s == "0" || s.is_empty() => false,
            Some(_) => {
                errors.push(FieldError::new("stream", "Stream must be a boolean"));
                false
            }
        };

        let system_prompt = match self.system_prompt {
            None => None,
            Some(Value::String(s)) => Some(s).filter(|s| !s.trim().is_empty()),
            Some(_) => {
                errors.push(FieldError::new(
                    "system_prompt",
                    "System prompt must be a string",
                ));
                None
            }
        };

        match message {
            Some(message) if errors.is_empty() => Ok(ChatRequest {
                message,
                model,
                temperature,
                max_tokens,
                stream,
                system_prompt,
            }),
            _ => Err(errors),
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Replace HTML-significant characters with entities.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            '\\' => out.push_str("&#x5C;"),
            '`' => out.push_str("&#96;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawChatRequest {
        serde_json::from_value(value).unwrap()
    }

    fn fields(errors: &[FieldError]) -> Vec<&'static str> {
        errors.iter().map(|e| e.field).collect()
    }

    #[test]
    fn test_minimal_request() {
        let req = raw(json!({"message": "  hello  "})).validate().unwrap();
        assert_eq!(req.message, "hello");
        assert_eq!(req.model, None);
        assert_eq!(req.temperature, None);
        assert_eq!(req.max_tokens, None);
        assert!(!req.stream);
    }

    #[test]
    fn test_full_request() {
        let req = raw(json!({
            "message": "hi",
            "model": "llama3-70b-8192",
            "temperature": 1.5,
            "max_tokens": 8192,
            "stream": true,
            "system_prompt": "be terse"
        }))
        .validate()
        .unwrap();
        assert_eq!(req.model.as_deref(), Some("llama3-70b-8192"));
        assert_eq!(req.temperature, Some(1.5));
        assert_eq!(req.max_tokens, Some(8192));
        assert!(req.stream);
        assert_eq!(req.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn test_message_is_escaped() {
        let req = raw(json!({"message": "<b>\"x\" & 'y'</b>"})).validate().unwrap();
        assert_eq!(
            req.message,
            "&lt;b&gt;&quot;x&quot; &amp; &#x27;y&#x27;&lt;&#x2F;b&gt;"
        );
    }

    #[test]
    fn test_blank_message_rejected() {
        for body in [json!({}), json!({"message": ""}), json!({"message": " \t\n "})] {
            let errors = raw(body).validate().unwrap_err();
            assert_eq!(fields(&errors), vec!["message"]);
        }
    }

    #[test]
    fn test_out_of_range_numbers_rejected() {
        for (temperature, max_tokens) in [(json!(-0.1), json!(1)), (json!(2.01), json!(8192))] {
            let errors = raw(json!({"message": "x", "temperature": temperature, "max_tokens": max_tokens}))
                .validate()
                .unwrap_err();
            assert_eq!(fields(&errors), vec!["temperature"]);
        }
        for max_tokens in [json!(0), json!(8193), json!(1.5), json!("many")] {
            let errors = raw(json!({"message": "x", "max_tokens": max_tokens}))
                .validate()
                .unwrap_err();
            assert_eq!(fields(&errors), vec!["max_tokens"]);
        }
    }

    #[test]
    fn test_every_violation_reported() {
        let errors = raw(json!({
            "message": "",
            "model": 7,
            "temperature": 3,
            "max_tokens": -1,
            "stream": "maybe"
        }))
        .validate()
        .unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["message", "model", "temperature", "max_tokens", "stream"]
        );
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let req = raw(json!({"message": "x", "temperature": "0.2", "max_tokens": "64", "stream": "true"}))
            .validate()
            .unwrap();
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.max_tokens, Some(64));
        assert!(req.stream);
    }

    #[test]
    fn test_nulls_treated_as_absent() {
        let req = raw(json!({"message": "x", "temperature": null, "max_tokens": null, "model": null}))
            .validate()
            .unwrap();
        assert_eq!(req.temperature, None);
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.model, None);
    }
}

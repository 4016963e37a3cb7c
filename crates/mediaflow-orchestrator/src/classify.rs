use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl ClassifiedError {
    fn new(severity: Severity, title: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.to_string(),
            message: message.into(),
        }
    }
}

struct Patterns {
    country_code: Regex,
    region_en: Regex,
    region_zh: Regex,
    bot_challenge: Regex,
    policy_violation: Regex,
    policy_may_violate: Regex,
    policy_word: Regex,
    violate_word: Regex,
    policy_zh: Regex,
    review_failed_zh: Regex,
    warn_vocabulary: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |src: &str| Regex::new(src).unwrap_or_else(|err| panic!("bad pattern {src}: {err}"));
        Patterns {
            country_code: re(r"\(([A-Za-z]{2})\)"),
            region_en: re(r"(?i)not available in your country"),
            region_zh: re(r"(?i)国家/地区不可用|地区不可用|Sora.*不可用"),
            bot_challenge: re(
                r"(?i)Just a moment|Enable JavaScript and cookies to continue|__cf_bm|cloudflare",
            ),
            policy_violation: re(r"(?i)Content Policy Violation"),
            policy_may_violate: re(r"(?i)may violate our content policies"),
            policy_word: re(r"(?i)content policies?"),
            violate_word: re(r"(?i)violate|violation"),
            policy_zh: re(r"内容.*(政策|审核|审查)"),
            review_failed_zh: re(r"审核未通过|审查未通过|内容不合规|内容违规"),
            warn_vocabulary: re(r"(?i)warn|limit|blocked|guardrail|违规|不支持|限制"),
        }
    })
}

/// Maps an upstream error (plain text, a structured error object, or text
/// carrying an embedded JSON body) onto a user-facing category.
pub fn classify(raw: &Value) -> ClassifiedError {
    let text = raw_text(raw);
    let inner = embedded_json(&text);

    let err = inner
        .as_ref()
        .and_then(|v| v.get("error"))
        .filter(|v| truthy(v))
        .or_else(|| raw.get("error").filter(|v| truthy(v)));
    let field = |name: &str| -> String {
        err.and_then(|e| e.get(name))
            .filter(|v| truthy(v))
            .map(value_to_string)
            .unwrap_or_default()
    };
    let code = field("code");
    let param = field("param");
    let msg = field("message");
    let merged = if msg.is_empty() { text.clone() } else { msg };
    let merged = merged.trim();

    let p = patterns();

    if code == "unsupported_country_code"
        || p.region_en.is_match(merged)
        || p.region_zh.is_match(merged)
    {
        let from_text = p
            .country_code
            .captures(merged)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let cc = if !param.is_empty() {
            param
        } else {
            from_text.unwrap_or_else(|| "unknown".to_string())
        };
        return ClassifiedError::new(
            Severity::Error,
            "region restricted",
            format!(
                "The generation service is not available from your current network region ({cc}). Switch to a proxy in a supported region and retry."
            ),
        );
    }

    if p.bot_challenge.is_match(&text) {
        return ClassifiedError::new(
            Severity::Error,
            "bot-challenge blocked",
            "The request was stopped by an anti-bot challenge page. Use a cleaner egress IP or proxy, or lower concurrency and request rate.",
        );
    }

    if p.policy_violation.is_match(merged)
        || p.policy_may_violate.is_match(merged)
        || (p.policy_word.is_match(merged) && p.violate_word.is_match(merged))
        || p.policy_zh.is_match(merged)
        || p.review_failed_zh.is_match(merged)
    {
        return ClassifiedError::new(
            Severity::Warning,
            "content policy blocked",
            "The generated content may violate the content policy. Adjust the prompt and retry.",
        );
    }

    if !merged.is_empty() {
        let severity = if p.warn_vocabulary.is_match(merged) {
            Severity::Warning
        } else {
            Severity::Error
        };
        return ClassifiedError::new(severity, "generation failed", merged);
    }

    ClassifiedError::new(
        Severity::Error,
        "generation failed",
        "Unknown error (upstream returned no readable message)",
    )
}

pub fn classify_text(raw: &str) -> ClassifiedError {
    classify(&Value::String(raw.to_string()))
}

fn raw_text(raw: &Value) -> String {
    let text = raw
        .get("message")
        .filter(|v| truthy(v))
        .map(value_to_string)
        .or_else(|| {
            raw.get("error")
                .and_then(|e| e.get("message"))
                .filter(|v| truthy(v))
                .map(value_to_string)
        })
        .unwrap_or_else(|| match raw {
            Value::Null => String::new(),
            other => value_to_string(other),
        });
    text.trim().to_string()
}

fn embedded_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    serde_json::from_str(&text[start..]).ok()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

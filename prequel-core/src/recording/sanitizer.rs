use serde_json::Value;
use std::collections::HashMap;

/// Headers that contain security-sensitive values and must be redacted.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-github-token",
    "x-hub-signature",
    "x-hub-signature-256",
];

/// Command-line flags whose following value must not be logged.
const SENSITIVE_FLAGS: &[&str] = &["--token", "--password", "--secret", "--key"];

/// Hosts whose URL path is itself a credential (incoming webhooks).
const SECRET_PATH_HOSTS: &[&str] = &["hooks.slack.com"];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    /// Check if a header name is sensitive and should be redacted.
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    /// Remove sensitive data from headers
    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let value = if Self::is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Remove sensitive data from JSON payloads
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sanitized = serde_json::Map::new();
                for (key, val) in map {
                    let sanitized_val = match key.as_str() {
                        "token" | "private_key" | "secret" | "password" | "webhook_url" => {
                            Value::String(REDACTED.to_string())
                        }
                        _ => Self::sanitize_json(val),
                    };
                    sanitized.insert(key.clone(), sanitized_val);
                }
                Value::Object(sanitized)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }

    /// Strip credentials from a URL: query strings and userinfo always go, and
    /// for incoming-webhook hosts the whole path goes too.
    pub fn sanitize_url(raw: &str) -> String {
        let Ok(mut parsed) = url::Url::parse(raw) else {
            return REDACTED.to_string();
        };
        let _ = parsed.set_username("");
        let _ = parsed.set_password(None);
        parsed.set_query(None);
        parsed.set_fragment(None);

        let secret_path = parsed
            .host_str()
            .map(|host| SECRET_PATH_HOSTS.contains(&host))
            .unwrap_or(false);
        if secret_path {
            parsed.set_path(REDACTED);
        }
        parsed.to_string()
    }

    /// Mask the values of sensitive `--flag value` pairs in a command line.
    pub fn sanitize_args(args: &[String]) -> Vec<String> {
        let mut sanitized = Vec::with_capacity(args.len());
        let mut mask_next = false;
        for arg in args {
            if mask_next {
                sanitized.push("****".to_string());
                mask_next = false;
                continue;
            }
            if let Some((flag, _)) = arg.split_once('=') {
                if SENSITIVE_FLAGS.contains(&flag) {
                    sanitized.push(format!("{}=****", flag));
                    continue;
                }
            }
            mask_next = SENSITIVE_FLAGS.contains(&arg.as_str());
            sanitized.push(arg.clone());
        }
        sanitized
    }
}

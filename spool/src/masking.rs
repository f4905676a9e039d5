//! Masking of sensitive values in captured bodies.
//!
//! A key is sensitive when it contains one of the configured sensitive keys,
//! compared case-insensitively, so `password`, `new_password` and
//! `X-Api-Token` all match `password`/`api`/`token`.

use serde_json::Value;

/// Replacement written over masked values.
pub const CLEANSED_SUBSTITUTE: &str = "********************";

#[derive(Debug, Clone, Default)]
pub struct Masker {
    keys: Vec<String>,
}

impl Masker {
    pub fn new<S: AsRef<str>>(keys: &[S]) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Whether `key` contains any sensitive key.
    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    /// Mask a body that is either JSON or form-encoded.
    ///
    /// JSON bodies are re-serialized compactly after masking, keeping the
    /// original key order; anything that does not parse as JSON is treated
    /// as `k=v&k=v` text.
    pub fn mask_body(&self, body: &str) -> String {
        if self.keys.is_empty() || body.is_empty() {
            return body.to_string();
        }
        match serde_json::from_str::<Value>(body) {
            Ok(mut value) => {
                self.mask_json(&mut value);
                serde_json::to_string(&value).unwrap_or_else(|_| body.to_string())
            }
            Err(_) => self.mask_form(body),
        }
    }

    /// Mask `k=v` pairs whose key is sensitive, preserving pair order.
    pub fn mask_form(&self, body: &str) -> String {
        body.split('&')
            .map(|pair| match pair.split_once('=') {
                Some((key, _)) if self.is_sensitive(key) => {
                    format!("{}={}", key, CLEANSED_SUBSTITUTE)
                }
                _ => pair.to_string(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Mask a JSON value in place.
    ///
    /// Objects have the values of sensitive keys replaced, arrays are walked
    /// element by element (batched bodies), and string scalars that
    /// themselves contain a sensitive key are replaced.
    pub fn mask_json(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map.iter_mut() {
                    if self.is_sensitive(key) {
                        *inner = Value::String(CLEANSED_SUBSTITUTE.to_string());
                    } else {
                        self.mask_json(inner);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.mask_json(item);
                }
            }
            Value::String(s) if self.is_sensitive(s) => {
                *value = Value::String(CLEANSED_SUBSTITUTE.to_string());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn masker() -> Masker {
        Masker::new(&["username", "api", "token", "key", "secret", "password", "signature"])
    }

    #[test]
    fn test_json_masking_keeps_key_order() {
        let body = r#"{"zeta":1,"password":"hunter2","alpha":{"token":"t","b":2,"a":1}}"#;
        assert_eq!(
            masker().mask_body(body),
            format!(
                r#"{{"zeta":1,"password":"{0}","alpha":{{"token":"{0}","b":2,"a":1}}}}"#,
                CLEANSED_SUBSTITUTE
            )
        );
    }

    #[test]
    fn test_form_masking_preserves_order() {
        assert_eq!(
            masker().mask_body("password=secret&x=public"),
            format!("password={}&x=public", CLEANSED_SUBSTITUTE)
        );
    }

    #[test]
    fn test_form_masking_is_case_insensitive_and_substring() {
        let masked = masker().mask_body("a=1&prefixed-username=bob&PassWord=hunter2&flag");
        assert_eq!(
            masked,
            format!(
                "a=1&prefixed-username={0}&PassWord={0}&flag",
                CLEANSED_SUBSTITUTE
            )
        );
    }

    #[test]
    fn test_json_masking_nested_and_batched() {
        let body = json!([
            {"user": {"username": "bob", "age": 3}, "items": [{"api_key": "k"}]},
            {"note": "my token is here", "ok": "fine"}
        ])
        .to_string();

        let masked: Value = serde_json::from_str(&masker().mask_body(&body)).unwrap();
        assert_eq!(masked[0]["user"]["username"], CLEANSED_SUBSTITUTE);
        assert_eq!(masked[0]["user"]["age"], 3);
        assert_eq!(masked[0]["items"][0]["api_key"], CLEANSED_SUBSTITUTE);
        assert_eq!(masked[1]["note"], CLEANSED_SUBSTITUTE);
        assert_eq!(masked[1]["ok"], "fine");
    }

    #[test]
    fn test_no_keys_leaves_body_alone() {
        let masker = Masker::new::<&str>(&[]);
        assert_eq!(masker.mask_body("password=x"), "password=x");
    }

    #[test]
    fn test_is_sensitive() {
        let masker = masker();
        assert!(masker.is_sensitive("X-Api-Token"));
        assert!(masker.is_sensitive("SECRET"));
        assert!(!masker.is_sensitive("content-type"));
    }
}

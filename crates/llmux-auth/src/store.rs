use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use llmux_common::now_epoch_ms;

/// Validity safety margin: a token expiring within this window counts as
/// invalid so callers refresh before the upstream rejects it.
pub const SAFETY_MARGIN_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expiry_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Co-located API key (iFlow-style providers); read and preserved.
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialHandle {
    ApiKey(String),
    OAuth(TokenSet),
    Empty,
}

impl CredentialHandle {
    /// Valid iff a non-empty API key, or OAuth tokens with more than the
    /// safety margin left.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        match self {
            CredentialHandle::ApiKey(key) => !key.is_empty(),
            CredentialHandle::OAuth(tokens) => {
                !tokens.access_token.is_empty()
                    && tokens.expiry_date - now_ms > SAFETY_MARGIN_MS
            }
            CredentialHandle::Empty => false,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            CredentialHandle::OAuth(tokens) => Some(tokens.access_token.as_str()),
            CredentialHandle::ApiKey(_) | CredentialHandle::Empty => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential file not found")]
    NotFound,
    #[error("corrupt credential file: {0}")]
    Corrupt(String),
    #[error("credential io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and writes persisted credentials. The store never refreshes.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore;

impl CredentialStore {
    pub fn new() -> Self {
        Self
    }

    /// Default on-disk location for a provider's credentials.
    pub fn default_path(provider: &str) -> PathBuf {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".llmux").join(format!("{provider}.json"))
    }

    /// Loads a handle, accepting the three historical on-disk schemas and
    /// normalizing to the canonical one.
    pub fn load(&self, path: &Path) -> Result<CredentialHandle, StoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        let value: Value =
            serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        normalize(&value)
    }

    /// Atomically persists the handle: write a temp sibling, then rename.
    pub fn save(&self, handle: &CredentialHandle, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let body = match handle {
            CredentialHandle::ApiKey(key) => serde_json::json!({ "apiKey": key }),
            CredentialHandle::OAuth(tokens) => {
                serde_json::to_value(tokens).map_err(|err| StoreError::Corrupt(err.to_string()))?
            }
            CredentialHandle::Empty => serde_json::json!({}),
        };
        let rendered = serde_json::to_string_pretty(&body)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, rendered)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Accepts the canonical snake_case schema, the legacy camelCase one, and
/// the variant carrying an `expired` RFC 3339 timestamp.
fn normalize(value: &Value) -> Result<CredentialHandle, StoreError> {
    let object = value
        .as_object()
        .ok_or_else(|| StoreError::Corrupt("expected a JSON object".to_string()))?;

    let access_token = string_field(object, &["access_token", "accessToken"]);
    let refresh_token = string_field(object, &["refresh_token", "refreshToken"]);
    let api_key = string_field(object, &["apiKey", "api_key"]);

    if access_token.is_none() && refresh_token.is_none() {
        return match api_key {
            Some(key) if !key.is_empty() => Ok(CredentialHandle::ApiKey(key)),
            _ if object.is_empty() => Ok(CredentialHandle::Empty),
            _ => Err(StoreError::Corrupt(
                "missing access_token/refresh_token".to_string(),
            )),
        };
    }

    let expiry_date = expiry_field(object)?;
    Ok(CredentialHandle::OAuth(TokenSet {
        access_token: access_token.unwrap_or_default(),
        refresh_token: refresh_token.unwrap_or_default(),
        expiry_date,
        token_type: string_field(object, &["token_type", "tokenType"]),
        scope: string_field(object, &["scope"]),
        api_key,
    }))
}

fn string_field(object: &serde_json::Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| object.get(*name))
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

fn expiry_field(object: &serde_json::Map<String, Value>) -> Result<i64, StoreError> {
    for name in ["expiry_date", "expiryDate", "expires_at", "expiresAt"] {
        if let Some(ms) = object.get(name).and_then(|value| value.as_i64()) {
            return Ok(ms);
        }
    }
    if let Some(stamp) = object.get("expired").and_then(|value| value.as_str()) {
        let parsed = OffsetDateTime::parse(stamp, &Rfc3339)
            .map_err(|err| StoreError::Corrupt(format!("invalid expired timestamp: {err}")))?;
        return Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64);
    }
    Err(StoreError::Corrupt("missing expiry field".to_string()))
}

/// Validity against the current wall clock.
pub fn is_valid(handle: &CredentialHandle) -> bool {
    handle.is_valid(now_epoch_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("llmux-store-{name}-{}", std::process::id()))
    }

    #[test]
    fn canonical_schema_round_trips() {
        let dir = temp_path("canonical");
        let path = dir.join("qwen.json");
        let store = CredentialStore::new();
        let handle = CredentialHandle::OAuth(TokenSet {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expiry_date: 1_700_000_000_000,
            token_type: Some("Bearer".to_string()),
            scope: Some("openid".to_string()),
            api_key: Some("sk-co-located".to_string()),
        });
        store.save(&handle, &path).unwrap();
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, handle);
        // apiKey sibling survives the rewrite.
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["apiKey"], "sk-co-located");
        assert_eq!(raw["expiry_date"], 1_700_000_000_000_i64);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn legacy_camel_case_is_normalized() {
        let dir = temp_path("camel");
        let path = dir.join("iflow.json");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            &path,
            r#"{"accessToken": "at", "refreshToken": "rt", "expiryDate": 123, "tokenType": "Bearer"}"#,
        )
        .unwrap();
        let loaded = CredentialStore::new().load(&path).unwrap();
        match loaded {
            CredentialHandle::OAuth(tokens) => {
                assert_eq!(tokens.access_token, "at");
                assert_eq!(tokens.expiry_date, 123);
                assert_eq!(tokens.token_type.as_deref(), Some("Bearer"));
            }
            other => panic!("unexpected handle: {other:?}"),
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn iso_expired_variant_is_normalized() {
        let dir = temp_path("iso");
        let path = dir.join("qwen.json");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            &path,
            r#"{"access_token": "at", "refresh_token": "rt", "expired": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let loaded = CredentialStore::new().load(&path).unwrap();
        match loaded {
            CredentialHandle::OAuth(tokens) => {
                assert_eq!(tokens.expiry_date, 1_704_067_200_000);
            }
            other => panic!("unexpected handle: {other:?}"),
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = CredentialStore::new()
            .load(Path::new("/nonexistent/llmux/creds.json"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn invalid_json_is_corrupt() {
        let dir = temp_path("corrupt");
        let path = dir.join("broken.json");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, "{not json").unwrap();
        let err = CredentialStore::new().load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn validity_honors_safety_margin() {
        let now = 1_000_000;
        let tokens = |expiry| {
            CredentialHandle::OAuth(TokenSet {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                expiry_date: expiry,
                token_type: None,
                scope: None,
                api_key: None,
            })
        };
        assert!(tokens(now + SAFETY_MARGIN_MS + 1).is_valid(now));
        assert!(!tokens(now + SAFETY_MARGIN_MS).is_valid(now));
        assert!(CredentialHandle::ApiKey("k".to_string()).is_valid(now));
        assert!(!CredentialHandle::ApiKey(String::new()).is_valid(now));
        assert!(!CredentialHandle::Empty.is_valid(now));
    }
}

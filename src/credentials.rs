use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Checked in order before the secrets file.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    api_key: String,
}

fn secrets_path() -> Result<PathBuf, String> {
    Ok(crate::settings::data_dir()?.join("secrets.json"))
}

/// Environment first, then the stored key.
pub fn load_api_key() -> Result<Option<String>, String> {
    for var in API_KEY_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
    load_from(&secrets_path()?)
}

pub fn save_api_key(key: &str) -> Result<(), String> {
    save_to(&secrets_path()?, key)
}

fn load_from(path: &Path) -> Result<Option<String>, String> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("Failed to read secrets file: {}", e)),
    };
    let parsed: SecretsFile =
        serde_json::from_str(&text).map_err(|e| format!("Failed to parse secrets file: {}", e))?;
    if parsed.api_key.trim().is_empty() {
        return Ok(None);
    }
    let bytes = BASE64
        .decode(parsed.api_key.as_bytes())
        .map_err(|e| format!("Invalid key blob in secrets file: {}", e))?;
    let key = String::from_utf8(bytes).map_err(|e| format!("Stored key is not UTF-8: {}", e))?;
    Ok(Some(key))
}

fn save_to(path: &Path, key: &str) -> Result<(), String> {
    let key = key.trim();
    if key.is_empty() {
        if path.exists() {
            fs::remove_file(path)
                .map_err(|e| format!("Failed to remove secrets file: {}", e))?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create secrets dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(&SecretsFile {
        api_key: BASE64.encode(key.as_bytes()),
    })
    .map_err(|e| format!("Failed to serialize secrets file: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write secrets file: {}", e))?;
    Ok(())
}

/// Show only the tail of a key in logs.
pub fn redact(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

// Per-account credential file store
// Loads credential JSON, adopts Base64-encoded blobs, and merge-saves
// rotated fields atomically (temp-file + rename), preserving unrelated keys

use anyhow::{Context, Result};
use base64::Engine;
use std::path::{Path, PathBuf};

use super::types::Credentials;

/// Load credentials from a JSON file.
pub fn load_from_file(path: &Path) -> Result<Credentials> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse credentials file: {}", path.display()))
}

/// Decode a Base64-encoded credentials blob supplied at startup.
pub fn load_from_base64(blob: &str) -> Result<Credentials> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .context("Credentials blob is not valid Base64")?;
    serde_json::from_slice(&decoded).context("Decoded credentials blob is not valid JSON")
}

/// Merge the rotated fields into the credentials file, preserving any keys
/// this gateway does not model, and write atomically.
pub fn merge_save(path: &Path, creds: &Credentials) -> Result<()> {
    let mut data: serde_json::Value = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    let update = serde_json::to_value(creds).context("Failed to serialize credentials")?;
    if let (Some(target), Some(fields)) = (data.as_object_mut(), update.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    } else {
        data = update;
    }

    write_atomic(path, &serde_json::to_string_pretty(&data)?)
}

/// Write content to a temp file next to `path`, then rename into place.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AuthMethod;
    use chrono::Utc;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiro-relay-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_load_from_base64() {
        let json = r#"{"refreshToken":"rt","region":"eu-west-1","authMethod":"social"}"#;
        let blob = base64::engine::general_purpose::STANDARD.encode(json);
        let creds = load_from_base64(&blob).unwrap();
        assert_eq!(creds.refresh_token.as_deref(), Some("rt"));
        assert_eq!(creds.region, "eu-west-1");
    }

    #[test]
    fn test_load_from_base64_rejects_garbage() {
        assert!(load_from_base64("!!not-base64!!").is_err());
    }

    #[test]
    fn test_merge_save_preserves_unknown_keys() {
        let path = temp_file("merge_preserves.json");
        std::fs::write(
            &path,
            r#"{"refreshToken":"old","customNote":"keep me","region":"us-east-1"}"#,
        )
        .unwrap();

        let creds = Credentials {
            access_token: Some("new-at".to_string()),
            refresh_token: Some("new-rt".to_string()),
            expires_at: Some(Utc::now()),
            auth_method: AuthMethod::Social,
            client_id: None,
            client_secret: None,
            profile_arn: Some("arn:aws:x".to_string()),
            region: "us-east-1".to_string(),
        };
        merge_save(&path, &creds).unwrap();

        let data: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data["customNote"], "keep me");
        assert_eq!(data["refreshToken"], "new-rt");
        assert_eq!(data["accessToken"], "new-at");
        assert_eq!(data["profileArn"], "arn:aws:x");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_merge_save_creates_file() {
        let path = temp_file("merge_creates.json");
        std::fs::remove_file(&path).ok();

        let creds = Credentials {
            refresh_token: Some("rt".to_string()),
            ..Default::default()
        };
        merge_save(&path, &creds).unwrap();

        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("rt"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_no_leftover_temp_file() {
        let path = temp_file("atomic.json");
        write_atomic(&path, "{}").unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        std::fs::remove_file(&path).ok();
    }
}

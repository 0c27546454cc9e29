//! Per-artifact generation receipts under `<project>/.receipts/`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::atomic::{read_json, write_json_atomic};
use crate::error::{StoreError, StoreResult};
use crate::usage::TokenUsage;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;
pub const RECEIPTS_DIR: &str = ".receipts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    pub schema_version: u64,
    pub image_id: String,
    pub mode: String,
    pub subject: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_size: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    pub requested_model: String,
    pub reported_model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub artifact_sha256: String,
    #[serde(default)]
    pub provider_request: Value,
    pub created_at: DateTime<Utc>,
}

pub fn artifact_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `pages/page_003.png` becomes `<root>/.receipts/pages/page_003.json`.
pub fn receipt_path(root: &Path, relative_path: &str) -> PathBuf {
    let mut path = root.join(RECEIPTS_DIR).join(relative_path);
    path.set_extension("json");
    path
}

pub fn write_receipt(root: &Path, relative_path: &str, receipt: &GenerationReceipt) -> StoreResult<PathBuf> {
    let path = receipt_path(root, relative_path);
    write_json_atomic(&path, receipt)?;
    Ok(path)
}

pub fn read_receipt(root: &Path, relative_path: &str) -> StoreResult<Option<GenerationReceipt>> {
    read_json(&receipt_path(root, relative_path))
}

/// Removes the receipt for an artifact; a missing receipt is fine.
pub fn remove_receipt(root: &Path, relative_path: &str) -> StoreResult<()> {
    let path = receipt_path(root, relative_path);
    match fs::remove_file(&path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(StoreError::io(path, err)),
        _ => Ok(()),
    }
}

/// Replaces inline image payloads with `<omitted>` so receipts stay small.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Value};

    use super::{
        artifact_digest, read_receipt, receipt_path, remove_receipt, sanitize_payload,
        write_receipt, GenerationReceipt, RECEIPT_SCHEMA_VERSION,
    };
    use crate::usage::TokenUsage;

    #[test]
    fn sanitize_drops_inline_image_data() {
        let payload = json!({
            "contents": [{"parts": [
                {"text": "a fox in a forest"},
                {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
            ]}]
        });
        let clean = sanitize_payload(&payload);
        assert_eq!(clean["contents"][0]["parts"][0]["text"], "a fox in a forest");
        assert_eq!(
            clean["contents"][0]["parts"][1]["inlineData"],
            json!({"mimeType": "image/png", "data": "<omitted>"})
        );
    }

    #[test]
    fn receipts_round_trip_and_remove() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt = GenerationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            image_id: "id-1".to_string(),
            mode: "create".to_string(),
            subject: "page".to_string(),
            prompt: "a fox in a forest".to_string(),
            aspect_ratio: "3:4".to_string(),
            image_size: "4K".to_string(),
            attachments: Vec::new(),
            source_image: None,
            requested_model: "gemini-3-pro-image-preview".to_string(),
            reported_model: Some("gemini-3-pro-image-preview-001".to_string()),
            usage: Some(TokenUsage::new(12, 1290, 1302)),
            artifact_sha256: artifact_digest(b"png"),
            provider_request: Value::Null,
            created_at: Utc::now(),
        };
        let path = write_receipt(temp.path(), "pages/generated_1.png", &receipt)?;
        assert_eq!(path, temp.path().join(".receipts/pages/generated_1.json"));
        assert_eq!(
            read_receipt(temp.path(), "pages/generated_1.png")?,
            Some(receipt)
        );

        remove_receipt(temp.path(), "pages/generated_1.png")?;
        remove_receipt(temp.path(), "pages/generated_1.png")?;
        assert!(!receipt_path(temp.path(), "pages/generated_1.png").exists());
        Ok(())
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(
            artifact_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

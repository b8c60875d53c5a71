use std::path::Path;

use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Build the JSON receipt written next to each analysis run. Base64 payloads
/// and inline data URIs are scrubbed so receipts stay reviewable; the file
/// digest in `file` metadata identifies the upload instead.
pub fn build_receipt(
    file_metadata: &Map<String, Value>,
    provider: &str,
    model: &str,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    warnings: &[String],
    outcome: &Value,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "file".to_string(),
        sanitize_payload(&Value::Object(file_metadata.clone())),
    );
    root.insert("provider".to_string(), Value::String(provider.to_string()));
    root.insert("model".to_string(), Value::String(model.to_string()));
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );
    root.insert("outcome".to_string(), scrub_data_uris(outcome));
    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

// The outcome's success branch carries the analysis under the "data" key,
// so the key-based scrub must not touch it. Only inline data URIs go.
fn scrub_data_uris(value: &Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted>".to_string())
        }
        Value::Array(rows) => Value::Array(rows.iter().map(scrub_data_uris).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, row)| (key.clone(), scrub_data_uris(row)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted>".to_string())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data" | "payload_base64" | "file_data_uri" | "image_url"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

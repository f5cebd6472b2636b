use crate::engine::EngineError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Batch-level failure reply. The store's own message rides along in details.
pub fn engine_err(id: &str, e: &EngineError) -> serde_json::Value {
    let details = match e {
        EngineError::DataAccess { what, source } => Some(json!({
            "stage": "load",
            "what": what,
            "cause": source.to_string(),
        })),
        EngineError::Persistence(source) => Some(json!({
            "stage": "persist",
            "cause": source.to_string(),
        })),
        EngineError::NotFound(_) => None,
    };
    err(id, e.code(), e.to_string(), details)
}

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// End-of-session roll-up written next to the artifacts as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub searches: u64,
    pub images_generated: u64,
    pub files_analyzed: u64,
    pub errors: u64,
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert(
        "session_id".to_string(),
        Value::String(summary.session_id.clone()),
    );
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "searches".to_string(),
        Value::Number(summary.searches.into()),
    );
    payload.insert(
        "images_generated".to_string(),
        Value::Number(summary.images_generated.into()),
    );
    payload.insert(
        "files_analyzed".to_string(),
        Value::Number(summary.files_analyzed.into()),
    );
    payload.insert("errors".to_string(), Value::Number(summary.errors.into()));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, SessionSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = SessionSummary {
            session_id: "session-123".to_string(),
            started_at: "2026-08-06T00:00:00+00:00".to_string(),
            finished_at: "2026-08-06T00:10:00+00:00".to_string(),
            searches: 3,
            images_generated: 1,
            files_analyzed: 0,
            errors: 1,
        };
        let mut extra = Map::new();
        extra.insert("text_model".to_string(), Value::String("m".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["session_id"], json!("session-123"));
        assert_eq!(parsed["searches"], json!(3));
        assert_eq!(parsed["images_generated"], json!(1));
        assert_eq!(parsed["errors"], json!(1));
        assert_eq!(parsed["text_model"], json!("m"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}

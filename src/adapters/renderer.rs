//! Deterministic report renderer.
//!
//! Raw reports arrive as JSON emitted by the assessment service. Rendering
//! is a pure function: stable key ordering and stable formatting, so
//! replaying the same raw bytes yields byte-identical output (and the same
//! digest), which makes the report-processing stage safe to rerun.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{ProcessedReport, RenderError, ReportRenderer};

/// Renders structured report JSON into a stable markdown document.
#[derive(Debug, Default)]
pub struct StructuredReportRenderer;

impl StructuredReportRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl ReportRenderer for StructuredReportRenderer {
    fn process(&self, raw: &[u8]) -> Result<ProcessedReport, RenderError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| RenderError::Unreadable(e.to_string()))?;

        let mut out = String::from("# Assessment Report\n");
        render_value(&mut out, &value, 0);

        let mut hasher = Sha256::new();
        hasher.update(out.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Ok(ProcessedReport {
            content: out,
            digest,
        })
    }
}

/// Write a value with sorted object keys, so output never depends on
/// serializer map ordering.
fn render_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let child = &map[key];
                match child {
                    Value::Object(_) | Value::Array(_) => {
                        out.push('\n');
                        out.push_str(&"#".repeat((depth + 2).min(6)));
                        out.push(' ');
                        out.push_str(key);
                        out.push('\n');
                        render_value(out, child, depth + 1);
                    }
                    _ => {
                        out.push_str("- ");
                        out.push_str(key);
                        out.push_str(": ");
                        out.push_str(&scalar_text(child));
                        out.push('\n');
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => render_value(out, item, depth + 1),
                    _ => {
                        out.push_str("- ");
                        out.push_str(&scalar_text(item));
                        out.push('\n');
                    }
                }
            }
        }
        _ => {
            out.push_str(&scalar_text(value));
            out.push('\n');
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = br#"{
        "patient": {"id": "P-42", "name": "Jane"},
        "scores": {"memory": 104, "attention": 98},
        "flags": ["valid"]
    }"#;

    #[test]
    fn test_replay_is_byte_identical() {
        let renderer = StructuredReportRenderer::new();
        let first = renderer.process(RAW).unwrap();
        let second = renderer.process(RAW).unwrap();

        assert_eq!(first.content, second.content);
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let renderer = StructuredReportRenderer::new();
        let a = renderer.process(br#"{"b": 1, "a": 2}"#).unwrap();
        let b = renderer.process(br#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(a.content, b.content);
    }

    #[test]
    fn test_rejects_non_json() {
        let renderer = StructuredReportRenderer::new();
        assert!(matches!(
            renderer.process(b"%PDF-1.4 garbage"),
            Err(RenderError::Unreadable(_))
        ));
    }

    #[test]
    fn test_renders_nested_sections() {
        let renderer = StructuredReportRenderer::new();
        let report = renderer.process(RAW).unwrap();
        assert!(report.content.starts_with("# Assessment Report\n"));
        assert!(report.content.contains("## patient"));
        assert!(report.content.contains("- memory: 104"));
        assert!(report.content.contains("- valid"));
    }
}

//! Claims: the only form in which tool output re-enters reasoning.
//!
//! Raw payloads stay in the execution log. Planner, executor and validation
//! gate only ever see bounded, evidence-linked statements.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'`)\]]+"#).expect("url regex")
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\.{0,2}/)?(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_.-]+\.[A-Za-z0-9]+")
        .expect("path regex")
});

/// An atomic fact derived from one tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Turn-unique identifier (`c<n>`)
    pub id: String,
    pub statement: String,
    /// Pointer to the execution-log entry the claim came from (`execution_log#<index>`)
    pub evidence_ref: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub source_tool: String,
}

impl Claim {
    /// Whether `reference` appears verbatim in this claim's statement.
    pub fn mentions(&self, reference: &str) -> bool {
        self.statement.contains(reference)
    }
}

/// Turns a tool payload into claims.
pub trait ClaimExtractor: Send + Sync {
    /// `next_id` is the number of claims already issued in the turn.
    fn extract(
        &self,
        tool_name: &str,
        payload: &Value,
        evidence_ref: &str,
        next_id: usize,
    ) -> Vec<Claim>;
}

/// Default extractor.
///
/// Structured payloads of the form `{"claims": [{"statement": .., "confidence": ..}]}`
/// map one-to-one. Anything else is walked leaf by leaf: string leaves are
/// split into lines, other scalars become `key: value`, and the leading
/// non-empty lines become claims. URL and path references found past the line
/// bound get a claim of their own so they stay verifiable.
///
/// Every statement is cut to `max_statement_chars`.
#[derive(Debug, Clone)]
pub struct PayloadClaimExtractor {
    pub max_claims: usize,
    pub max_statement_chars: usize,
    /// Extra claims for references not already inside a line claim
    pub max_references: usize,
}

impl Default for PayloadClaimExtractor {
    fn default() -> Self {
        Self {
            max_claims: 8,
            max_statement_chars: 400,
            max_references: 16,
        }
    }
}

impl PayloadClaimExtractor {
    fn truncate(&self, s: &str) -> String {
        if s.chars().count() <= self.max_statement_chars {
            return s.to_string();
        }
        s.chars().take(self.max_statement_chars).collect()
    }

    fn structured(&self, payload: &Value) -> Option<Vec<(String, f64)>> {
        let items = payload.get("claims")?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some((s.clone(), 1.0)),
                    Value::Object(obj) => {
                        let statement = obj.get("statement")?.as_str()?.to_string();
                        let confidence = obj
                            .get("confidence")
                            .and_then(Value::as_f64)
                            .unwrap_or(1.0)
                            .clamp(0.0, 1.0);
                        Some((statement, confidence))
                    }
                    _ => None,
                })
                .collect(),
        )
    }

    fn textual(&self, payload: &Value) -> Vec<(String, f64)> {
        let mut texts = Vec::new();
        leaves(payload, None, &mut texts);

        let mut out: Vec<(String, f64)> = texts
            .iter()
            .flat_map(|t| t.lines())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(self.max_claims)
            .map(|l| (self.truncate(l), 1.0))
            .collect();

        // A reference longer than a statement could only be kept cut, and a
        // cut URL reads as fabricated.
        let mut seen = HashSet::new();
        let mut added = 0;
        for reference in texts.iter().flat_map(|t| extract_references(t)) {
            if added >= self.max_references {
                break;
            }
            if !seen.insert(reference.clone())
                || reference.chars().count() > self.max_statement_chars
                || out.iter().any(|(s, _)| s.contains(&reference))
            {
                continue;
            }
            out.push((reference, 1.0));
            added += 1;
        }
        out
    }
}

/// Collect the text leaves of `value`. Objects are visited in key order.
fn leaves(value: &Value, key: Option<&str>, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                leaves(item, key, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                leaves(v, Some(k), out);
            }
        }
        scalar => out.push(match key {
            Some(k) => format!("{}: {}", k, scalar),
            None => scalar.to_string(),
        }),
    }
}

impl ClaimExtractor for PayloadClaimExtractor {
    fn extract(
        &self,
        tool_name: &str,
        payload: &Value,
        evidence_ref: &str,
        next_id: usize,
    ) -> Vec<Claim> {
        let statements = self
            .structured(payload)
            .unwrap_or_else(|| self.textual(payload));

        statements
            .into_iter()
            .enumerate()
            .map(|(i, (statement, confidence))| Claim {
                id: format!("c{}", next_id + i),
                statement: self.truncate(&statement),
                evidence_ref: evidence_ref.to_string(),
                confidence,
                source_tool: tool_name.to_string(),
            })
            .collect()
    }
}

/// Extract URL and file-path references from text, in order of appearance,
/// without duplicates.
pub fn extract_references(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for m in URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':']);
        spans.push((m.start(), m.start() + url.len()));
        if seen.insert(url.to_string()) {
            out.push(url.to_string());
        }
    }

    for m in PATH_RE.find_iter(text) {
        // Paths inside URLs are already covered by the URL itself.
        if spans.iter().any(|&(s, e)| m.start() >= s && m.start() < e) {
            continue;
        }
        let path = m.as_str().trim_end_matches('.');
        if seen.insert(path.to_string()) {
            out.push(path.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_references_urls_and_paths() {
        let text =
            "See https://docs.rs/tokio/latest/tokio/. Then edit src/main.rs and ./config/app.yaml.";
        let refs = extract_references(text);
        assert_eq!(
            refs,
            vec![
                "https://docs.rs/tokio/latest/tokio/".to_string(),
                "src/main.rs".to_string(),
                "./config/app.yaml".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_references_plain_prose() {
        assert!(extract_references("the build passed, nothing to report").is_empty());
    }

    #[test]
    fn test_structured_payload_maps_claims() {
        let extractor = PayloadClaimExtractor::default();
        let payload = json!({"claims": [
            {"statement": "tokio 1.38 is current", "confidence": 0.9},
            "serde supports derive"
        ]});

        let claims = extractor.extract("web_search", &payload, "execution_log#3", 5);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].id, "c5");
        assert_eq!(claims[0].confidence, 0.9);
        assert_eq!(claims[1].id, "c6");
        assert_eq!(claims[1].statement, "serde supports derive");
        assert!(claims.iter().all(|c| c.source_tool == "web_search"));
        assert!(claims.iter().all(|c| c.evidence_ref == "execution_log#3"));
    }

    #[test]
    fn test_text_payload_is_bounded_but_keeps_references() {
        let extractor = PayloadClaimExtractor {
            max_claims: 2,
            max_statement_chars: 24,
            max_references: 4,
        };
        let payload = json!([
            "line one",
            "line two with a long tail of words\nline three",
            "found https://example.com/a/b",
        ]);

        let claims = extractor.extract("read_file", &payload, "execution_log#0", 0);
        let statements: Vec<&str> = claims.iter().map(|c| c.statement.as_str()).collect();
        assert_eq!(
            statements,
            vec!["line one", "line two with a long tai", "https://example.com/a/b"]
        );
    }

    #[test]
    fn test_large_file_content_is_split_and_bounded() {
        let extractor = PayloadClaimExtractor::default();
        let content = format!("see src/main.rs\n{}", "x".repeat(120_000));
        let payload = json!({"path": "notes.md", "total_lines": 2, "content": content});

        let claims = extractor.extract("read_file", &payload, "execution_log#0", 0);
        assert!(claims.iter().all(|c| c.statement.chars().count() <= 400));

        let statements: Vec<&str> = claims.iter().map(|c| c.statement.as_str()).collect();
        assert_eq!(statements.len(), 4);
        let long_line = "x".repeat(400);
        for expected in ["see src/main.rs", long_line.as_str(), "notes.md", "total_lines: 2"] {
            assert!(statements.contains(&expected), "missing {:.40}", expected);
        }
    }

    #[test]
    fn test_reference_claims_are_capped() {
        let extractor = PayloadClaimExtractor {
            max_claims: 1,
            max_statement_chars: 40,
            max_references: 2,
        };
        let long_url = format!("https://example.com/{}", "a".repeat(60));
        let payload = json!([
            "links:",
            long_url,
            "https://example.com/1\nhttps://example.com/2\nhttps://example.com/3",
        ]);

        let claims = extractor.extract("search", &payload, "execution_log#0", 0);
        let statements: Vec<&str> = claims.iter().map(|c| c.statement.as_str()).collect();
        assert_eq!(
            statements,
            vec!["links:", "https://example.com/1", "https://example.com/2"]
        );
    }

    #[test]
    fn test_null_payload_yields_nothing() {
        let extractor = PayloadClaimExtractor::default();
        assert!(extractor
            .extract("noop", &Value::Null, "execution_log#0", 0)
            .is_empty());
    }
}

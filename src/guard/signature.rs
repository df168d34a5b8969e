//! Normalized call signatures for loop detection.
//!
//! A signature is the tool name, the sorted argument keys and each value
//! lowercased, whitespace-collapsed and truncated. Two calls are "materially
//! identical" when their signatures match exactly or, with a similarity
//! threshold below 1.0, when their value tokens overlap enough.

use std::collections::BTreeSet;

use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignature {
    pub tool_name: String,
    keys: Vec<String>,
    /// `tool|key=value|...` after normalization
    normalized: String,
    /// sha256 of `normalized`, hex
    digest: String,
    tokens: BTreeSet<String>,
}

impl CallSignature {
    pub fn new(tool_name: &str, args: &Value, value_truncate_chars: usize) -> Self {
        let mut pairs: Vec<(String, String)> = match args {
            Value::Object(obj) => obj
                .iter()
                .map(|(k, v)| (k.clone(), normalize_value(v, value_truncate_chars)))
                .collect(),
            Value::Null => Vec::new(),
            other => vec![(String::new(), normalize_value(other, value_truncate_chars))],
        };
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut normalized = tool_name.to_string();
        for (k, v) in &pairs {
            normalized.push('|');
            normalized.push_str(k);
            normalized.push('=');
            normalized.push_str(v);
        }

        let tokens = pairs
            .iter()
            .flat_map(|(k, v)| {
                v.split(|c: char| !c.is_alphanumeric() && c != '_')
                    .filter(|t| !t.is_empty())
                    .map(move |t| format!("{}:{}", k, t))
            })
            .collect();

        let digest = hex::encode(Sha256::digest(normalized.as_bytes()));

        Self {
            tool_name: tool_name.to_string(),
            keys: pairs.into_iter().map(|(k, _)| k).collect(),
            normalized,
            digest,
            tokens,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Jaccard similarity of value tokens. Different tools or argument key
    /// sets are never similar.
    pub fn similarity(&self, other: &CallSignature) -> f64 {
        if self.tool_name != other.tool_name || self.keys != other.keys {
            return 0.0;
        }
        if self.digest == other.digest {
            return 1.0;
        }
        let union = self.tokens.union(&other.tokens).count();
        if union == 0 {
            return 0.0;
        }
        self.tokens.intersection(&other.tokens).count() as f64 / union as f64
    }

    pub fn materially_identical(&self, other: &CallSignature, threshold: f64) -> bool {
        if threshold >= 1.0 {
            return self.digest == other.digest;
        }
        self.similarity(other) >= threshold
    }
}

fn normalize_value(value: &Value, truncate: usize) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        // Object keys serialize sorted; nested structure is compared as text.
        other => other.to_string(),
    };
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(truncate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization_ignores_case_whitespace_and_key_order() {
        let a = CallSignature::new("search", &json!({"q": "Rust  Async", "page": 1}), 64);
        let b = CallSignature::new("search", &json!({"page": 1, "q": "rust async"}), 64);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.normalized(), "search|page=1|q=rust async");
    }

    #[test]
    fn test_truncation_bounds_comparison() {
        let a = CallSignature::new("search", &json!({"q": "abcdefgh-one"}), 8);
        let b = CallSignature::new("search", &json!({"q": "abcdefgh-two"}), 8);
        assert!(a.materially_identical(&b, 1.0));

        let a = CallSignature::new("search", &json!({"q": "abcdefgh-one"}), 64);
        let b = CallSignature::new("search", &json!({"q": "abcdefgh-two"}), 64);
        assert!(!a.materially_identical(&b, 1.0));
    }

    #[test]
    fn test_similarity_threshold() {
        let a = CallSignature::new("search", &json!({"q": "tokio runtime shutdown order"}), 64);
        let b = CallSignature::new("search", &json!({"q": "tokio runtime shutdown"}), 64);
        assert_eq!(a.similarity(&b), 0.75);
        assert!(a.materially_identical(&b, 0.7));
        assert!(!a.materially_identical(&b, 0.8));

        let other_tool = CallSignature::new("fetch", &json!({"q": "tokio runtime shutdown"}), 64);
        assert_eq!(b.similarity(&other_tool), 0.0);
    }
}

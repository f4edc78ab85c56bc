//! Sanitization of phase-1 fetch captures.
//!
//! Before a captured response is exposed to the credential-free phase-2
//! payload, sensitive headers are dropped, any occurrence of a known
//! credential value inside the capture is scrubbed, and the body is
//! optionally projected to declared fields.

use aho_corasick::AhoCorasick;

use crate::proxy::headers::{HeaderFilter, REDACTION_MARKER};

/// Sanitizes captured responses before they cross into phase 2.
pub struct Sanitizer {
    filter: HeaderFilter,
    /// Matches literal credential values anywhere in captured strings.
    scrubber: Option<AhoCorasick>,
}

impl Sanitizer {
    /// `credential_values` are the live secrets of this execution (caller
    /// token, substituted header credentials); any occurrence of them in a
    /// capture is replaced with the redaction marker.
    pub fn new(credential_values: &[String]) -> Self {
        let values: Vec<&str> = credential_values
            .iter()
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .collect();

        let scrubber = if values.is_empty() {
            None
        } else {
            AhoCorasick::new(&values).ok()
        };

        Self {
            filter: HeaderFilter::new(true),
            scrubber,
        }
    }

    /// Sanitize one captured response value (`{status, headers, body}`).
    pub fn sanitize_capture(
        &self,
        mut capture: serde_json::Value,
        response_fields: Option<&[String]>,
    ) -> serde_json::Value {
        if let Some(headers) = capture.get_mut("headers").and_then(|h| h.as_object_mut()) {
            headers.retain(|name, _| !self.filter.is_sensitive(name));
        }

        if let Some(fields) = response_fields {
            if let Some(body) = capture.get_mut("body").and_then(|b| b.as_object_mut()) {
                body.retain(|name, _| fields.iter().any(|f| f == name));
            }
        }

        self.scrub_value(&mut capture);
        capture
    }

    fn scrub_value(&self, value: &mut serde_json::Value) {
        let Some(scrubber) = &self.scrubber else {
            return;
        };

        match value {
            serde_json::Value::String(s) => {
                if scrubber.is_match(s.as_str()) {
                    // replace_all wants one replacement per pattern.
                    let markers = vec![REDACTION_MARKER; scrubber.patterns_len()];
                    *s = scrubber.replace_all(s, &markers);
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.scrub_value(item);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.scrub_value(item);
                }
            }
            _ => {}
        }
    }
}

//! Per-execution audit log of attempted outbound requests.
//!
//! One [`AuditEntry`] is recorded for every request the proxy sees, in the
//! order requests were accepted (not the order responses arrived): a slot is
//! claimed at accept time and filled in when the outcome is known. Each
//! execution owns its own log, so entries from concurrent executions can
//! never interleave.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// One attempted outbound request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// ISO-8601 UTC timestamp of proxy arrival.
    pub timestamp: String,
    pub method: String,
    pub url: String,
    pub hostname: String,
    /// Request headers as seen by the proxy, with sensitive values redacted.
    pub request_headers: BTreeMap<String, String>,
    /// Final status code returned to the payload; absent on transport errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    pub blocked: bool,
    /// Human-readable reason, set iff blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// A pending entry recorded at request arrival.
    pub fn pending(
        method: impl Into<String>,
        url: impl Into<String>,
        hostname: impl Into<String>,
        request_headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            method: method.into(),
            url: url.into(),
            hostname: hostname.into(),
            request_headers,
            status_code: None,
            response_headers: None,
            blocked: false,
            reason: None,
            error: None,
        }
    }
}

/// Ordered audit log for one execution.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot for an accepted request; returns the slot index.
    pub fn begin(&self, entry: AuditEntry) -> usize {
        let mut entries = self.entries.lock().expect("audit log poisoned");
        entries.push(entry);
        entries.len() - 1
    }

    /// Fill in the outcome of a previously claimed slot.
    pub fn complete(&self, index: usize, fill: impl FnOnce(&mut AuditEntry)) {
        let mut entries = self.entries.lock().expect("audit log poisoned");
        if let Some(entry) = entries.get_mut(index) {
            fill(entry);
        }
    }

    /// Copy of the current log, in arrival order.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_preserve_arrival_order() {
        let log = AuditLog::new();

        let a = log.begin(AuditEntry::pending("GET", "http://a/", "a", BTreeMap::new()));
        let b = log.begin(AuditEntry::pending("GET", "http://b/", "b", BTreeMap::new()));

        // Complete out of order; arrival order must survive.
        log.complete(b, |e| e.status_code = Some(200));
        log.complete(a, |e| e.status_code = Some(502));

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hostname, "a");
        assert_eq!(entries[0].status_code, Some(502));
        assert_eq!(entries[1].hostname, "b");
        assert_eq!(entries[1].status_code, Some(200));
    }

    #[test]
    fn test_blocked_entry_serialization() {
        let mut entry = AuditEntry::pending("GET", "https://x.test/", "x.test", BTreeMap::new());
        entry.blocked = true;
        entry.reason = Some("domain not allowed".to_string());
        entry.status_code = Some(403);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["blocked"], true);
        assert_eq!(json["reason"], "domain not allowed");
        assert_eq!(json["statusCode"], 403);
        assert_eq!(json["hostname"], "x.test");
        // Unset optional fields are omitted entirely.
        assert!(json.get("error").is_none());
        assert!(json.get("responseHeaders").is_none());
    }

    #[test]
    fn test_timestamp_is_rfc3339_utc() {
        let entry = AuditEntry::pending("GET", "http://a/", "a", BTreeMap::new());
        assert!(entry.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&entry.timestamp).is_ok());
    }
}

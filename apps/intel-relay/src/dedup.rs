//! Duplicate filtering for externally sourced intel items.
//!
//! An item is a duplicate when its content fingerprint, or the start of its title, matches
//! something accepted within the lookback window. Thresholds are tunable heuristics.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::protocol::ServerMessage;

pub const MAX_TITLE_CHARS: usize = 120;
pub const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelItem {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_risk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl IntelItem {
    fn normalized(mut self) -> Self {
        self.title = truncate_chars(self.title.trim(), MAX_TITLE_CHARS);
        self.summary = truncate_chars(self.summary.trim(), MAX_SUMMARY_CHARS);
        self
    }

    fn tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if self.impact_level.as_deref() == Some("critical") {
            tags.push("[CRITICAL]");
        }
        match self.opportunity_risk.as_deref() {
            Some("opportunity") => tags.push("[OPPORTUNITY]"),
            Some("risk") => tags.push("[RISK]"),
            _ => {}
        }
        tags
    }
}

/// First 16 hex chars of SHA-256 over the lowercased, trimmed title and summary.
pub fn fingerprint(title: &str, summary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(summary.trim().to_lowercase().as_bytes());
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(16);
    digest
}

#[derive(Debug, Clone, Copy)]
pub struct DedupSettings {
    pub window: Duration,
    pub title_prefix_chars: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            window: Duration::hours(48),
            title_prefix_chars: 50,
        }
    }
}

struct Seen {
    fingerprint: String,
    title: String,
    at: DateTime<Utc>,
}

/// Accepted items inside the lookback window, oldest first.
pub struct RecentItems {
    settings: DedupSettings,
    seen: VecDeque<Seen>,
}

impl RecentItems {
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            settings,
            seen: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.settings.window;
        while self.seen.front().is_some_and(|seen| seen.at < cutoff) {
            self.seen.pop_front();
        }
    }

    pub fn is_duplicate(&mut self, title: &str, summary: &str, now: DateTime<Utc>) -> bool {
        self.expire(now);
        let print = fingerprint(title, summary);
        let prefix = truncate_chars(&title.to_lowercase(), self.settings.title_prefix_chars);
        self.seen
            .iter()
            .any(|seen| seen.fingerprint == print || seen.title.contains(&prefix))
    }

    pub fn record(&mut self, title: &str, summary: &str, now: DateTime<Utc>) {
        self.seen.push_back(Seen {
            fingerprint: fingerprint(title, summary),
            title: title.to_lowercase(),
            at: now,
        });
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub delivered: usize,
}

/// Filters submitted intel and pushes accepted items to every connection.
pub struct IntelFeed {
    hub: Arc<Hub>,
    recent: Mutex<RecentItems>,
}

impl IntelFeed {
    pub fn new(hub: Arc<Hub>, settings: DedupSettings) -> Self {
        Self {
            hub,
            recent: Mutex::new(RecentItems::new(settings)),
        }
    }

    pub fn ingest(&self, items: Vec<IntelItem>) -> IngestReport {
        let now = Utc::now();
        let mut report = IngestReport::default();
        let mut accepted = Vec::new();
        {
            let mut recent = self.recent.lock();
            for item in items.into_iter().map(IntelItem::normalized) {
                if item.title.is_empty() {
                    report.skipped += 1;
                    continue;
                }
                if recent.is_duplicate(&item.title, &item.summary, now) {
                    debug!(title = %truncate_chars(&item.title, 50), "skipping duplicate intel");
                    report.duplicates += 1;
                    continue;
                }
                recent.record(&item.title, &item.summary, now);

                let tags = item.tags();
                let mut item = item;
                if !tags.is_empty() {
                    item.title = truncate_chars(
                        &format!("{} {}", tags.join(" "), item.title),
                        MAX_TITLE_CHARS,
                    );
                }
                item.published_at.get_or_insert(now);
                accepted.push(item);
            }
        }
        report.accepted = accepted.len();
        if accepted.is_empty() {
            return report;
        }

        match serde_json::to_string(&ServerMessage::Intel { items: accepted }) {
            Ok(encoded) => report.delivered = self.hub.broadcast(&encoded, None).delivered,
            Err(err) => warn!(error = %err, "failed to encode intel items"),
        }
        info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            "ingested intel items"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use serde_json::Value;

    fn item(title: &str, summary: &str) -> IntelItem {
        IntelItem {
            title: title.into(),
            summary: summary.into(),
            recommendation: None,
            impact_level: None,
            opportunity_risk: None,
            published_at: None,
        }
    }

    #[test_timeout::timeout]
    fn fingerprint_ignores_case_and_padding() {
        assert_eq!(fingerprint(" Rates Fall ", "Cuts"), fingerprint("rates fall", "cuts "));
        assert_eq!(fingerprint("a", "b").len(), 16);
        assert_ne!(fingerprint("a", "b"), fingerprint("a", "c"));
    }

    #[test_timeout::timeout]
    fn title_prefix_and_window() {
        let mut recent = RecentItems::new(DedupSettings::default());
        let then = Utc::now() - Duration::hours(47);
        recent.record("Fed signals earlier rate cuts than expected", "x", then);

        let now = Utc::now();
        assert!(recent.is_duplicate("Fed signals earlier rate cuts", "different", now));
        assert!(!recent.is_duplicate("Oil prices climb", "x", now));

        let later = now + Duration::hours(2);
        assert!(!recent.is_duplicate("Fed signals earlier rate cuts", "different", later));
        assert!(recent.is_empty());
    }

    #[test_timeout::timeout]
    fn ingest_filters_tags_and_broadcasts() {
        let hub = Arc::new(Hub::default());
        let (handle, mut rx) = ConnectionHandle::new(4);
        hub.register(handle, None).unwrap();
        let feed = IntelFeed::new(Arc::clone(&hub), DedupSettings::default());

        let mut critical = item("Supply shock", "ports closed");
        critical.impact_level = Some("critical".into());
        let report = feed.ingest(vec![
            critical,
            item("supply shock", "ports closed"),
            item("   ", "empty"),
        ]);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 1);

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "intel");
        assert_eq!(frame["items"][0]["title"], "[CRITICAL] Supply shock");

        let again = feed.ingest(vec![item("Supply shock", "ports closed")]);
        assert_eq!(again.accepted, 0);
        assert!(rx.try_recv().is_err());
    }
}

//! Core domain model and normalization leaves for MPOF.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "mpof-core";

/// Container selector applied when a source does not configure one.
pub const DEFAULT_CONTAINER_SELECTOR: &str = ".job";

/// One configured scrape origin with its selectors and run metadata.
///
/// The orchestrator mutates the metadata fields in place after each run;
/// everything else is caller-owned configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub requires_rendering: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub selectors: SelectorMap,
    #[serde(default)]
    pub search_params: BTreeMap<String, String>,
    #[serde(default)]
    pub last_scraped: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub error_count: u32,
}

fn default_active() -> bool {
    true
}

/// Field-selector map over the fixed known field set.
///
/// `deny_unknown_fields` rejects typo'd selector keys at registry load time
/// instead of silently extracting nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorMap {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub institute: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SelectorMap {
    pub fn container_or_default(&self) -> &str {
        self.container.as_deref().unwrap_or(DEFAULT_CONTAINER_SELECTOR)
    }
}

/// Canonical persisted opportunity record.
///
/// Serialized with camelCase keys so the on-disk store keeps the historical
/// format. Immutable once created except for `archived_date`, stamped when
/// the record leaves the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub institute: String,
    /// Canonical `YYYY-MM-DD` deadline, see [`normalize_deadline`].
    pub deadline: String,
    pub link: String,
    pub description: String,
    pub source: String,
    /// `YYYY-MM-DD` date of first capture.
    pub date_added: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_date: Option<String>,
}

const RELEVANT_KEYWORDS: &[&str] = &[
    "medical physics",
    "radiation oncology",
    "medical imaging",
    "radiotherapy",
    "nuclear medicine",
    "diagnostic imaging",
    "radiation therapy",
    "medical radiation",
    "imaging physics",
    "radiation safety",
    "dosimetry",
    "radiobiology",
    "proton therapy",
    "radiation protection",
    "medical dosimetry",
];

/// Keyword gate for medical-physics relevance over title + description.
pub fn is_relevant(title: &str, description: &str) -> bool {
    let text = format!("{title} {description}").to_lowercase();
    RELEVANT_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-folded `title-institute` key used for deduplication.
///
/// Dedup compares these raw keys, never the hashed display id, so a hash
/// collision can never merge two distinct records.
pub fn dedup_key(title: &str, institute: &str) -> String {
    format!("{}-{}", title.to_lowercase(), institute.to_lowercase())
}

/// Short stable record id: sha-256 of the dedup key, truncated to 12 hex chars.
pub fn opportunity_id(title: &str, institute: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dedup_key(title, institute).as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(12);
    id
}

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})").expect("valid ISO date pattern"));
static SLASH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("valid slash date pattern"));

/// Best-effort parse of free-form deadline text into canonical `YYYY-MM-DD`.
///
/// Policy, in order: empty input defaults to `today + 180` days; an embedded
/// ISO `YYYY-M-D` date wins; otherwise a `MM/DD/YYYY` date is accepted as the
/// single slash-format interpretation. Matches that are not valid calendar
/// dates fall through, and anything unrecognized gets the 180-day default.
/// Never fails; output is always a valid `YYYY-MM-DD` string.
pub fn normalize_deadline(text: &str, today: NaiveDate) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return default_deadline(today);
    }
    let lower = trimmed.to_lowercase();

    if let Some(caps) = ISO_DATE.captures(&lower) {
        if let Some(date) = calendar_date(&caps[1], &caps[2], &caps[3]) {
            return date.format("%Y-%m-%d").to_string();
        }
    }

    if let Some(caps) = SLASH_DATE.captures(&lower) {
        if let Some(date) = calendar_date(&caps[3], &caps[1], &caps[2]) {
            return date.format("%Y-%m-%d").to_string();
        }
    }

    default_deadline(today)
}

fn calendar_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn default_deadline(today: NaiveDate) -> String {
    (today + Duration::days(180)).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date")
    }

    #[test]
    fn id_is_stable_and_input_sensitive() {
        let a = opportunity_id("PhD in Dosimetry", "MIT");
        let b = opportunity_id("PhD in Dosimetry", "MIT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, opportunity_id("PhD in Dosimetry", "ETH"));
        assert_ne!(a, opportunity_id("MSc in Dosimetry", "MIT"));
    }

    #[test]
    fn id_is_case_insensitive_like_the_dedup_key() {
        assert_eq!(
            opportunity_id("PhD in Dosimetry", "MIT"),
            opportunity_id("phd in dosimetry", "mit")
        );
    }

    #[test]
    fn relevance_gate_matches_domain_keywords() {
        assert!(is_relevant("Postdoc in Dosimetry", ""));
        assert!(is_relevant("PhD Position", "research in radiation oncology"));
        assert!(!is_relevant("Software Engineer", "backend role"));
        assert!(!is_relevant("", ""));
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  PhD \t in\n Medical   Physics "), "PhD in Medical Physics");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn iso_deadline_is_normalized_and_zero_padded() {
        assert_eq!(normalize_deadline("2025-03-05", today()), "2025-03-05");
        assert_eq!(normalize_deadline("2025-3-5", today()), "2025-03-05");
        assert_eq!(
            normalize_deadline("Apply by 2025-09-30 at noon", today()),
            "2025-09-30"
        );
    }

    #[test]
    fn slash_deadline_uses_month_day_order() {
        assert_eq!(normalize_deadline("03/05/2025", today()), "2025-03-05");
        assert_eq!(normalize_deadline("Deadline: 12/31/2025", today()), "2025-12-31");
    }

    #[test]
    fn empty_and_unrecognized_deadlines_default_to_180_days() {
        assert_eq!(normalize_deadline("", today()), "2025-11-28");
        assert_eq!(normalize_deadline("no date here", today()), "2025-11-28");
        assert_eq!(normalize_deadline("rolling admissions", today()), "2025-11-28");
    }

    #[test]
    fn calendar_invalid_matches_fall_through_to_default() {
        assert_eq!(normalize_deadline("2025-13-45", today()), "2025-11-28");
        assert_eq!(normalize_deadline("25/12/2025", today()), "2025-11-28");
    }

    #[test]
    fn selector_map_falls_back_to_default_container() {
        let map = SelectorMap::default();
        assert_eq!(map.container_or_default(), DEFAULT_CONTAINER_SELECTOR);
        let map = SelectorMap {
            container: Some(".job-listing".to_string()),
            ..SelectorMap::default()
        };
        assert_eq!(map.container_or_default(), ".job-listing");
    }

    #[test]
    fn opportunity_round_trips_with_camel_case_keys() {
        let opp = Opportunity {
            id: opportunity_id("PhD in Dosimetry", "MIT"),
            title: "PhD in Dosimetry".to_string(),
            institute: "MIT".to_string(),
            deadline: "2025-09-30".to_string(),
            link: "https://example.org/jobs/1".to_string(),
            description: String::new(),
            source: "Example Jobs".to_string(),
            date_added: "2025-06-01".to_string(),
            scraped_at: Utc::now(),
            archived_date: None,
        };
        let json = serde_json::to_string(&opp).expect("serialize");
        assert!(json.contains("\"dateAdded\""));
        assert!(json.contains("\"scrapedAt\""));
        assert!(!json.contains("archivedDate"), "absent until archived");
        let back: Opportunity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, opp);
    }

    #[test]
    fn unknown_selector_keys_are_rejected() {
        let err = serde_json::from_str::<SelectorMap>(r#"{"titel": ".job-title"}"#);
        assert!(err.is_err());
    }
}

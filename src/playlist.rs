use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TVG_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)tvg-id="([^"]+)""#).unwrap());
static TVG_LOGO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)tvg-logo="([^"]+)""#).unwrap());
static GROUP_TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)group-title="([^"]+)""#).unwrap());
static URL_SCHEME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").unwrap());

const EXTINF_TAG: &str = "#EXTINF";

/// One playlist entry, as persisted for the playback front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub name: String,
    pub url: String,
    pub tvg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvg_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_title: Option<String>,
    /// `None` until the channel has been probed
    pub working: Option<bool>,
}

#[derive(Debug, Default)]
struct PendingEntry {
    name: String,
    tvg_id: Option<String>,
    tvg_logo: Option<String>,
    group_title: Option<String>,
}

impl PendingEntry {
    fn from_extinf(line: &str) -> Self {
        let name = line
            .split_once(',')
            .map(|(_, name)| name.trim().to_string())
            .unwrap_or_default();

        Self {
            name,
            tvg_id: capture_attribute(&TVG_ID_REGEX, line),
            tvg_logo: capture_attribute(&TVG_LOGO_REGEX, line),
            group_title: capture_attribute(&GROUP_TITLE_REGEX, line),
        }
    }

    fn into_record(self, url: &str) -> ChannelRecord {
        ChannelRecord {
            name: self.name,
            url: url.to_string(),
            tvg_id: self.tvg_id,
            tvg_logo: self.tvg_logo,
            group_title: self.group_title,
            working: None,
        }
    }
}

fn capture_attribute(regex: &Regex, line: &str) -> Option<String> {
    regex
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Returns whether a line starts with `scheme://`
#[must_use]
pub fn looks_like_url(line: &str) -> bool {
    URL_SCHEME_REGEX.is_match(line)
}

/// Parses extended-M3U text into channel records, in file order.
///
/// Never fails: malformed blocks and URLs without a preceding `#EXTINF` are skipped.
/// When `require_tvg_id` is set, entries without a `tvg-id` are left out.
#[must_use]
pub fn parse(text: &str, require_tvg_id: bool) -> Vec<ChannelRecord> {
    let mut channels = Vec::new();
    let mut pending: Option<PendingEntry> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(EXTINF_TAG) {
            pending = Some(PendingEntry::from_extinf(line));
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        // Any content line consumes the buffered metadata, URL or not
        let Some(entry) = pending.take() else {
            continue;
        };
        if !looks_like_url(line) {
            continue;
        }
        if require_tvg_id && entry.tvg_id.is_none() {
            continue;
        }

        channels.push(entry.into_record(line));
    }

    channels
}

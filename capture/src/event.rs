use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use url::Url;
use xxhash_rust::xxh64::xxh64;

#[derive(Error, Debug)]
pub enum ParseEventError {
    #[error("invalid event name: {0:?}")]
    InvalidName(String),
    #[error("missing event url")]
    MissingUrl,
    #[error("parsing url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("url {0:?} has no host")]
    MissingHost(String),
}

/// Wire-format event posted by the tracker snippet, plus the request
/// attributes the handler captures alongside the body.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "l", default)]
    pub location: String,
    #[serde(rename = "r", default)]
    pub referrer: String,
    #[serde(rename = "lt", default)]
    pub load_time: i32,
    #[serde(rename = "fb", default)]
    pub ttfb: i32,
    #[serde(rename = "sw", default)]
    pub screen_w: i32,
    #[serde(rename = "sh", default)]
    pub screen_h: i32,
    #[serde(rename = "pr", default)]
    pub pixel_ratio: f64,
    #[serde(rename = "pd", default)]
    pub pixel_depth: i32,
    #[serde(rename = "tz", default)]
    pub timezone: String,
    #[serde(default)]
    pub utm_source: String,
    #[serde(default)]
    pub utm_medium: String,
    #[serde(default)]
    pub utm_campaign: String,
    #[serde(default)]
    pub utm_content: String,
    #[serde(default)]
    pub utm_term: String,

    /// Captured from `Accept-Language` by the handler, never from the body.
    #[serde(skip)]
    pub lang: String,
    /// Ingest timestamp, stamped when the request is decoded.
    #[serde(skip, default = "Utc::now")]
    pub created: DateTime<Utc>,

    /// Transient: feeds visitor-ID derivation and geo enrichment only.
    /// The worker clears it before the event can reach storage.
    #[serde(skip)]
    pub client_ip: String,
    /// Transient: feeds visitor-ID derivation and device enrichment only.
    /// The worker clears it before the event can reach storage.
    #[serde(skip)]
    pub user_agent: String,
}

impl Default for RawEvent {
    fn default() -> Self {
        RawEvent {
            name: String::new(),
            location: String::new(),
            referrer: String::new(),
            load_time: 0,
            ttfb: 0,
            screen_w: 0,
            screen_h: 0,
            pixel_ratio: 0.0,
            pixel_depth: 0,
            timezone: String::new(),
            utm_source: String::new(),
            utm_medium: String::new(),
            utm_campaign: String::new(),
            utm_content: String::new(),
            utm_term: String::new(),
            lang: String::new(),
            created: Utc::now(),
            client_ip: String::new(),
            user_agent: String::new(),
        }
    }
}

/// Geo and device attributes attached by the worker. Lookups that fail
/// leave the whole value at its default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub platform: String,
    pub device_type: String,
    pub longitude: f64,
    pub latitude: f64,
    pub country: String,
    pub subdivision: String,
    pub city: String,
    pub bot: bool,
}

/// An event accepted by ingress, on its way through the queue to storage.
#[derive(Debug, Clone)]
pub struct Event {
    pub raw: RawEvent,
    pub domain: String,
    pub path: String,
    pub visitor_id: String,
    pub enrichment: Enrichment,
}

/// Validates the event name against the allow-list and splits the page
/// URL into domain and path.
pub fn parse_event(raw: RawEvent, valid_event_names: &[String]) -> Result<Event, ParseEventError> {
    if !valid_event_name(valid_event_names, &raw.name) {
        return Err(ParseEventError::InvalidName(raw.name));
    }
    let (domain, path) = extract_domain_path(&raw.location)?;
    Ok(Event {
        raw,
        domain,
        path,
        visitor_id: String::new(),
        enrichment: Enrichment::default(),
    })
}

fn valid_event_name(valid_event_names: &[String], name: &str) -> bool {
    !name.is_empty() && valid_event_names.iter().any(|n| n == name)
}

/// Splits an absolute page URL into `(domain, path)`, with the leading
/// `www.` stripped from the host.
pub fn extract_domain_path(event_url: &str) -> Result<(String, String), ParseEventError> {
    if event_url.is_empty() {
        return Err(ParseEventError::MissingUrl);
    }
    let url = Url::parse(event_url).map_err(|source| ParseEventError::InvalidUrl {
        url: event_url.to_string(),
        source,
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| ParseEventError::MissingHost(event_url.to_string()))?;
    let domain = host.strip_prefix("www.").unwrap_or(host);
    Ok((domain.to_string(), url.path().to_string()))
}

/// Derives the daily pseudonymous visitor ID: an xxh64 digest of the
/// visitor's stable attributes keyed by the rotating salt, as lowercase
/// hex. The salt rotating every 24h bounds linkability to one day.
pub fn visitor_id(salt: &str, event: &Event) -> String {
    let raw = &event.raw;
    let mut input = String::with_capacity(
        salt.len()
            + event.domain.len()
            + raw.client_ip.len()
            + raw.user_agent.len()
            + raw.lang.len()
            + raw.timezone.len()
            + 24,
    );
    input.push_str(salt);
    input.push_str(&event.domain);
    input.push_str(&raw.client_ip);
    input.push_str(&raw.user_agent);
    input.push_str(&raw.lang);
    input.push_str(&raw.timezone);
    write!(
        input,
        "{}{}{}{:.2}",
        raw.screen_w, raw.screen_h, raw.pixel_depth, raw.pixel_ratio
    )
    .expect("writing to a String cannot fail");
    format!("{:x}", xxh64(input.as_bytes(), 0))
}

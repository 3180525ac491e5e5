//! Geo and device enrichment, applied by the worker between the queue
//! and the batch buffer.

use geoip::{GeoIpError, GeoIpReader};
use thiserror::Error;
use woothee::parser::Parser;

use crate::event::Event;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("geo database unavailable")]
    GeoUnavailable,
    #[error("error looking up ip: {0}")]
    GeoLookup(#[from] GeoIpError),
}

/// Substrings that mark a user-agent as a bot. The list matches what the
/// deployed tracker exclusions were tuned against; keep it verbatim.
pub const BOT_AGENTS: [&str; 24] = [
    "bot",
    "crawler",
    "spider",
    "headless",
    "yandex",
    "google-extended",
    "feedfetcher-google",
    "mediapartners-google",
    "apis-google",
    "google-inspectiontool",
    "googleother",
    "google-adwords-instant",
    "slurp",
    "wget",
    "Python-urllib",
    "python-requests",
    "aiohttp",
    "curl",
    "httpx",
    "libwww-perl",
    "httpunit",
    "nutch",
    "go-http-client",
    "vegeta",
];

pub fn is_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    BOT_AGENTS.iter().any(|bot| ua.contains(bot))
}

/// Fills in geo attributes from the transient client IP, then device
/// attributes from the transient user-agent. A failed geo lookup aborts
/// enrichment; the caller persists the event with empty fields.
pub fn enrich_event(event: &mut Event, geo: Option<&GeoIpReader>) -> Result<(), EnrichError> {
    let geo = geo.ok_or(EnrichError::GeoUnavailable)?;
    let lookup = geo.lookup(&event.raw.client_ip)?;
    event.enrichment.longitude = lookup.longitude;
    event.enrichment.latitude = lookup.latitude;
    event.enrichment.country = lookup.country;
    event.enrichment.subdivision = lookup.subdivision;
    event.enrichment.city = lookup.city;

    if event.raw.user_agent.len() > 1 {
        update_user_agent_details(event);
        event.enrichment.bot = is_bot(&event.raw.user_agent);
    }
    Ok(())
}

fn update_user_agent_details(event: &mut Event) {
    let parser = Parser::new();
    let Some(result) = parser.parse(&event.raw.user_agent) else {
        return;
    };
    let e = &mut event.enrichment;
    if result.category == "crawler" {
        // Crawler rows keep the vocabulary downstream dashboards key on:
        // a *Bot browser name, no versions, and a Computer device.
        e.browser = bot_browser_name(result.name);
        e.browser_version = "0.0".to_string();
        e.os = "Bot".to_string();
        e.os_version = "0.0".to_string();
        e.platform = "Bot".to_string();
        e.device_type = "Computer".to_string();
        return;
    }
    if result.name != "UNKNOWN" {
        e.browser = result.name.to_string();
    }
    e.browser_version = major_minor(&result.version);
    if result.os != "UNKNOWN" {
        e.os = result.os.to_string();
    }
    e.os_version = major_minor(&result.os_version);
    e.platform = platform_for(result.os);
    e.device_type = device_type_for(result.category);
}

fn bot_browser_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mapped = if lowered.contains("google") {
        "GoogleBot"
    } else if lowered.contains("slurp") || lowered.contains("yahoo") {
        "YahooBot"
    } else if lowered.contains("bing") || lowered.contains("msn") {
        "BingBot"
    } else if lowered.contains("baidu") {
        "BaiduBot"
    } else if lowered.contains("yandex") {
        "YandexBot"
    } else {
        return name.to_string();
    };
    mapped.to_string()
}

/// Truncates a version string to `major.minor`, defaulting missing or
/// unparsable components to zero.
fn major_minor(version: &str) -> String {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    format!("{major}.{minor}")
}

fn platform_for(os: &str) -> String {
    let platform = if os.contains("Windows Phone") {
        "WindowsPhone"
    } else if os.contains("Windows") {
        "Windows"
    } else if os.contains("Mac OSX") || os.contains("Mac OS X") {
        "Mac"
    } else if os.contains("iPhone") {
        "iPhone"
    } else if os.contains("iPad") {
        "iPad"
    } else if os.contains("Android") || os.contains("Linux") || os.contains("ChromeOS") {
        "Linux"
    } else if os.contains("BlackBerry") {
        "Blackberry"
    } else if os.contains("PlayStation") {
        "Playstation"
    } else if os.contains("Xbox") {
        "Xbox"
    } else if os.contains("Nintendo") {
        "Nintendo"
    } else {
        "Unknown"
    };
    platform.to_string()
}

fn device_type_for(category: &str) -> String {
    let device = match category {
        "pc" => "Computer",
        "smartphone" => "Phone",
        "mobilephone" => "Phone",
        "appliance" => "TV",
        _ => "Unknown",
    };
    device.to_string()
}

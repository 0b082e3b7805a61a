//! HTTP plumbing shared by all providers: client construction and mapping of
//! responses and transport failures onto [`ProviderError`].

use std::net::IpAddr;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use url::Url;

use enricher_shared::{EnricherError, ProviderError, Result};

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("Enricher/", env!("CARGO_PKG_VERSION"));

/// Longest error body excerpt carried in a [`ProviderError`].
const BODY_EXCERPT_CHARS: usize = 200;

/// Markers of quota exhaustion in 403 bodies.
const QUOTA_MARKERS: &[&str] = &[
    "rateLimitExceeded",
    "dailyLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "insufficient_quota",
];

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| EnricherError::Network(format!("failed to build HTTP client: {e}")))
}

/// Classify a non-success response.
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let detail = || format!("HTTP {status}: {}", excerpt(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        StatusCode::FORBIDDEN if QUOTA_MARKERS.iter().any(|m| body.contains(m)) => {
            ProviderError::RateLimited {
                retry_after: parse_retry_after(headers),
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail()),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Transient(detail()),
        s if s.is_server_error() => ProviderError::Transient(detail()),
        _ => ProviderError::Rejected(detail()),
    }
}

/// Classify a transport-level failure.
pub(crate) fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}

/// `Retry-After` as delta-seconds. HTTP-date values are ignored.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

//! User-Agent string sent with every probe and fetch.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/splitfetch";

/// Default User-Agent for download requests (identifies the tool and version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("splitfetch/{version} (segmented-downloader; +{PROJECT_UA_URL})")
}

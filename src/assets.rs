//! Opaque encoding of upstream asset URLs into proxy paths. The image-proxy
//! collaborator holds the matching decoder.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use url::Url;

/// Encode a raw asset URL into an opaque proxy path segment.
///
/// Absolute URLs become `u_<base64url>` over the full URL; anything else is
/// treated as an upstream-relative path, gets a leading `/` if missing, and
/// becomes `p_<base64url>`. Padding is stripped in both cases.
pub fn encode_asset_url(raw: &str) -> String {
    if Url::parse(raw).is_ok() {
        format!("u_{}", URL_SAFE_NO_PAD.encode(raw))
    } else if raw.starts_with('/') {
        format!("p_{}", URL_SAFE_NO_PAD.encode(raw))
    } else {
        format!("p_{}", URL_SAFE_NO_PAD.encode(format!("/{raw}")))
    }
}

/// Build the client-facing proxy URL for a raw asset URL.
pub fn proxy_asset_url(base_url: &str, raw: &str) -> String {
    format!(
        "{}/images/{}",
        base_url.trim_end_matches('/'),
        encode_asset_url(raw)
    )
}

/// Normalise a list of candidate asset URLs, dropping non-strings, empty or
/// whitespace-only entries, a bare `/`, and absolute URLs whose path is `/`
/// with no query or fragment.
pub fn normalize_asset_urls(values: &[serde_json::Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(|value| value.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "/")
        .filter(|s| match Url::parse(s) {
            Ok(url) => !(url.path() == "/" && url.query().is_none() && url.fragment().is_none()),
            Err(_) => true,
        })
        .map(str::to_string)
        .collect()
}

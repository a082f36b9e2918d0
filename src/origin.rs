//! Origin derivation for pages hosted in a web surface.

use url::Url;

/// Origin reported for the wallet's own internal pseudo-page.
pub const INTERNAL_ORIGIN: &str = "https://rabby.io";

/// Url prefix of the internal pseudo-page. It is never parsed as a web url.
pub const INTERNAL_PAGE_PREFIX: &str = "rabby://internal";

pub fn is_internal_page(url: &str) -> bool {
    url.starts_with(INTERNAL_PAGE_PREFIX) || url == INTERNAL_ORIGIN
}

/// Canonical `scheme://host[:port]` of `url`.
///
/// Returns `None` for urls that cannot be parsed or have an opaque origin
/// (`about:blank`, `data:` ...).
pub fn origin_of(url: &str) -> Option<String> {
    if is_internal_page(url) {
        return Some(INTERNAL_ORIGIN.to_string());
    }

    let origin = Url::parse(url.trim()).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Like [`origin_of`], but keeps the raw string when no tuple origin exists so
/// that such pages still get a stable, non-matching identity.
pub fn origin_or_raw(url: &str) -> String {
    origin_of(url).unwrap_or_else(|| url.trim().to_string())
}

/// Host part of a url or origin string, lowercased.
pub fn host_of(url: &str) -> Option<String> {
    if is_internal_page(url) {
        return host_of(INTERNAL_ORIGIN);
    }
    Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(|host| host.to_ascii_lowercase())
}

/// Whether two urls/origins share a host. Unparseable input never matches.
pub fn same_host(left: &str, right: &str) -> bool {
    match (host_of(left), host_of(right)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_tuple_origins() {
        assert_eq!(
            origin_of("https://app.uniswap.org/swap?chain=1").as_deref(),
            Some("https://app.uniswap.org")
        );
        assert_eq!(
            origin_of("http://localhost:3000/a").as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(origin_of("about:blank"), None);
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn internal_page_is_a_literal_origin() {
        assert_eq!(
            origin_of("rabby://internal/approval?id=3").as_deref(),
            Some(INTERNAL_ORIGIN)
        );
        assert!(same_host("rabby://internal/home", INTERNAL_ORIGIN));
    }

    #[test]
    fn host_comparison_ignores_path_and_case() {
        assert!(same_host("https://Dapp.Example/x", "https://dapp.example"));
        assert!(!same_host("https://dapp.example", "https://evil.example"));
        assert!(!same_host("garbage", "garbage"));
    }
}

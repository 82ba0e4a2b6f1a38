use url::form_urlencoded;
use url::Url;

use trawler_core::CrawlError;

/// Canonical URL form, the identity of a fetched resource:
/// lowercased scheme and host, leading `www.` stripped, duplicate path
/// slashes collapsed, trailing slash dropped (except root), query pairs
/// sorted by key, fragment dropped. Rejects anything that is not http(s)
/// with a non-empty host.
pub fn canonicalize(raw: &str) -> Result<String, CrawlError> {
    canonicalize_with(raw, false)
}

pub fn canonicalize_with(raw: &str, keep_fragment: bool) -> Result<String, CrawlError> {
    let parsed =
        Url::parse(raw).map_err(|e| CrawlError::InvalidUrl(format!("{raw}: {e}")))?;

    let scheme = parsed.scheme().to_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(CrawlError::InvalidUrl(format!(
            "{raw}: unsupported scheme {scheme}"
        )));
    }

    let mut host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::InvalidUrl(format!("{raw}: missing host")))?
        .to_lowercase();
    while let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    if host.is_empty() {
        return Err(CrawlError::InvalidUrl(format!("{raw}: empty host")));
    }

    let path = normalize_path(parsed.path());
    let query = parsed.query().map(normalize_query).unwrap_or_default();

    let mut out = String::with_capacity(raw.len());
    out.push_str(&scheme);
    out.push_str("://");
    out.push_str(&host);
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(&path);
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    if keep_fragment {
        if let Some(fragment) = parsed.fragment() {
            out.push('#');
            out.push_str(fragment);
        }
    }
    Ok(out)
}

fn normalize_path(raw: &str) -> String {
    let mut path = String::with_capacity(raw.len().max(1));
    let mut prev_slash = false;
    for ch in raw.chars() {
        if ch == '/' {
            if !prev_slash {
                path.push('/');
            }
            prev_slash = true;
        } else {
            path.push(ch);
            prev_slash = false;
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

fn normalize_query(raw: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    // sort_by is stable: duplicate keys keep their original order
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// md5 of the canonical URL string: the seen-set key.
pub fn fingerprint(url: &str) -> Result<String, CrawlError> {
    let canonical = canonicalize(url)?;
    Ok(format!("{:x}", md5::compute(canonical.as_bytes())))
}

/// RFC-3986 join of `href` against `base`, canonicalized. `None` when the
/// join fails or the result is not crawlable.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let base_url = Url::parse(base).ok()?;
    let joined = base_url.join(href).ok()?;
    canonicalize(joined.as_str()).ok()
}

/// Same host (after canonicalization) as the base document.
pub fn is_internal(base: &str, href: &str) -> bool {
    match (trawler_core::host_of(base), trawler_core::host_of(href)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_canonicalization() {
        assert_eq!(
            canonicalize("http://EXAMPLE.com/a//b/?z=1&a=2#frag").unwrap(),
            "http://example.com/a/b?a=2&z=1"
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        for url in [
            "http://EXAMPLE.com/a//b/?z=1&a=2#frag",
            "https://www.rust-lang.org/learn/",
            "http://a.test/",
            "http://a.test:8080/path?x=1&x=0",
        ] {
            let once = canonicalize(url).unwrap();
            assert_eq!(canonicalize(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_equivalent_urls_share_a_fingerprint() {
        let base = fingerprint("http://example.com/path?a=1&b=2").unwrap();
        for variant in [
            "HTTP://example.com/path?a=1&b=2",
            "http://EXAMPLE.COM/path?a=1&b=2",
            "http://www.example.com/path?a=1&b=2",
            "http://example.com//path///?a=1&b=2",
            "http://example.com/path/?a=1&b=2",
            "http://example.com/path?b=2&a=1",
            "http://example.com/path?a=1&b=2#section",
        ] {
            assert_eq!(fingerprint(variant).unwrap(), base, "variant {variant}");
        }
    }

    #[test]
    fn test_duplicate_query_keys_keep_order() {
        assert_eq!(
            canonicalize("http://a.test/?b=2&a=first&a=second").unwrap(),
            "http://a.test/?a=first&a=second&b=2"
        );
    }

    #[test]
    fn test_rejects_non_http_schemes_and_empty_hosts() {
        assert!(matches!(
            canonicalize("ftp://example.com/file"),
            Err(CrawlError::InvalidUrl(_))
        ));
        assert!(matches!(
            canonicalize("mailto:someone@example.com"),
            Err(CrawlError::InvalidUrl(_))
        ));
        assert!(canonicalize("not a url at all").is_err());
    }

    #[test]
    fn test_root_path_is_preserved() {
        assert_eq!(canonicalize("http://a.test").unwrap(), "http://a.test/");
        assert_eq!(canonicalize("http://a.test/").unwrap(), "http://a.test/");
    }

    #[test]
    fn test_fragment_kept_only_on_request() {
        assert_eq!(
            canonicalize_with("http://a.test/page#top", true).unwrap(),
            "http://a.test/page#top"
        );
        assert_eq!(
            canonicalize("http://a.test/page#top").unwrap(),
            "http://a.test/page"
        );
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        assert_eq!(
            resolve("http://a.test/dir/page", "../x").as_deref(),
            Some("http://a.test/x")
        );
        assert_eq!(
            resolve("http://a.test/", "/x?b=1&a=2").as_deref(),
            Some("http://a.test/x?a=2&b=1")
        );
        // resolving an absolute URL equals canonicalizing it directly
        assert_eq!(
            resolve("http://a.test/", "http://B.test/y/").unwrap(),
            canonicalize("http://B.test/y/").unwrap()
        );
    }

    #[test]
    fn test_is_internal_ignores_www_and_case() {
        assert!(is_internal("http://a.test/page", "http://www.A.test/other"));
        assert!(!is_internal("http://a.test/page", "http://b.test/other"));
    }
}

use answerpipe_core::{truncate_chars, Error, Result, MAX_URL_LEN};
use std::net::{Ipv4Addr, Ipv6Addr};
use url::Host;

/// Truthy `ANSWERPIPE_DEV_MODE` relaxes the loopback/private-network checks
/// below. Metadata endpoints stay blocked regardless.
pub fn development_mode() -> bool {
    crate::env_truthy("ANSWERPIPE_DEV_MODE")
}

const METADATA_HOSTNAMES: &[&str] = &["metadata.google.internal", "metadata.azure.com"];
const METADATA_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Canonicalize a raw URL into an absolute `http(s)` URL.
///
/// Accepted inputs: absolute http/https URLs, protocol-relative `//host/...`
/// (treated as https), and bare domains containing a dot (prefixed with
/// `https://`). Everything else (other schemes, empty or whitespace input)
/// is rejected. The output is truncated to `max_len` characters (0 =
/// unlimited) only after canonicalization.
pub fn normalize(raw: &str, max_len: usize) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("empty url".to_string()));
    }

    let candidate = if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        trimmed.to_string()
    };

    let parsed = match url::Url::parse(&candidate) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if candidate.contains('.') && !candidate.contains(char::is_whitespace) {
                url::Url::parse(&format!("https://{candidate}"))
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?
            } else {
                return Err(Error::InvalidUrl(format!(
                    "not an absolute url: {candidate}"
                )));
            }
        }
        Err(e) => return Err(Error::InvalidUrl(e.to_string())),
    };

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {other}")));
        }
    }
    if parsed.host_str().is_none() {
        return Err(Error::InvalidUrl("missing host".to_string()));
    }

    Ok(truncate_chars(parsed.as_str(), max_len))
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_loopback()
        || o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 100 && (64..=127).contains(&o[1]))
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    let seg0 = ip.segments()[0];
    ip.is_loopback() || (seg0 & 0xfe00) == 0xfc00 || (seg0 & 0xffc0) == 0xfe80
}

/// Fail-closed check for textual IPv6 literals: anything that does not parse
/// as a plain address (zone ids, malformed syntax) counts as private.
pub fn ipv6_literal_blocked(text: &str) -> bool {
    let inner = text.trim().trim_matches(|c| c == '[' || c == ']');
    match inner.parse::<Ipv6Addr>() {
        Ok(ip) => is_private_ipv6(ip),
        Err(_) => true,
    }
}

enum Blocked {
    /// Rejected in every environment.
    Always(String),
    /// Rejected unless running in development mode.
    NonDev(String),
}

fn classify_ipv4(ip: Ipv4Addr) -> Option<Blocked> {
    if ip == METADATA_IPV4 {
        return Some(Blocked::Always(format!("cloud metadata endpoint: {ip}")));
    }
    if is_private_ipv4(ip) {
        return Some(Blocked::NonDev(format!("private or loopback ipv4: {ip}")));
    }
    None
}

fn classify_ipv6(ip: Ipv6Addr) -> Option<Blocked> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_ipv4(v4);
    }
    if is_private_ipv6(ip) {
        return Some(Blocked::NonDev(format!("private or loopback ipv6: {ip}")));
    }
    None
}

fn classify_host(host: &Host<&str>) -> Option<Blocked> {
    match host {
        Host::Ipv4(ip) => classify_ipv4(*ip),
        Host::Ipv6(ip) => classify_ipv6(*ip),
        Host::Domain(d) => {
            let d = d.trim_end_matches('.').to_ascii_lowercase();
            if METADATA_HOSTNAMES.contains(&d.as_str()) {
                return Some(Blocked::Always(format!("cloud metadata endpoint: {d}")));
            }
            if d == "localhost" || d.ends_with(".localhost") {
                return Some(Blocked::NonDev(format!("loopback hostname: {d}")));
            }
            if d.contains(':') && ipv6_literal_blocked(&d) {
                return Some(Blocked::NonDev(format!("ipv6-like hostname: {d}")));
            }
            None
        }
    }
}

/// Validate a URL as a scrape target. Builds on [`normalize`], then rejects
/// destinations inside loopback/private/link-local/CGNAT address space and
/// cloud metadata endpoints. The private-space rejections are waived in
/// development mode; the metadata rejections never are.
pub fn validate_scrape_url(raw: &str) -> Result<String> {
    let normalized = normalize(raw, MAX_URL_LEN)?;
    let parsed = url::Url::parse(&normalized).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    let host = parsed
        .host()
        .ok_or_else(|| Error::InvalidUrl("missing host".to_string()))?;

    match classify_host(&host) {
        Some(Blocked::Always(reason)) => {
            tracing::warn!(url = %normalized, %reason, "rejected scrape target");
            Err(Error::UnsafeUrl(reason))
        }
        Some(Blocked::NonDev(reason)) => {
            if development_mode() {
                Ok(normalized)
            } else {
                tracing::warn!(url = %normalized, %reason, "rejected scrape target");
                Err(Error::UnsafeUrl(reason))
            }
        }
        None => Ok(normalized),
    }
}

fn is_tracking_param(name: &str) -> bool {
    let n = name.to_ascii_lowercase();
    n.starts_with("utm_") || matches!(n.as_str(), "gclid" | "fbclid" | "ref")
}

/// Deduplication/ranking key for a URL: canonicalized, `www.` stripped,
/// tracking params removed, fragment dropped, trailing slashes trimmed on
/// non-root paths, then lowercased. Idempotent; inputs that fail
/// canonicalization come back trimmed but otherwise untouched.
pub fn normalize_url_for_key(raw: &str) -> String {
    let Ok(normalized) = normalize(raw, 0) else {
        return raw.trim().to_string();
    };
    let Ok(mut u) = url::Url::parse(&normalized) else {
        return raw.trim().to_string();
    };

    u.set_fragment(None);

    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        u.set_query(None);
    } else {
        let mut qp = u.query_pairs_mut();
        qp.clear();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
        drop(qp);
    }

    if let Some(host) = u.host_str() {
        let lowered = host.to_ascii_lowercase();
        if let Some(stripped) = lowered.strip_prefix("www.") {
            let stripped = stripped.to_string();
            let _ = u.set_host(Some(&stripped));
        }
    }

    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        u.set_path(path.trim_end_matches('/'));
    }

    u.to_string().to_lowercase()
}

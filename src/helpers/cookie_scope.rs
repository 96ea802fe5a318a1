//! Rewrites `Set-Cookie` `Path` attributes so a service mounted below the
//! root path (e.g. `/blog`) gets cookies scoped under its own prefix,
//! without the backend needing to know where it's mounted.
//!
//! A cookie is only in scope for rewriting when it is first-party to the
//! request: `Domain` absent, or `Domain` exactly equal to the request host.
//! A `Domain` naming a different host (or a parent domain, to cover
//! subdomains) is left untouched — rewriting those would silently narrow a
//! cookie the backend explicitly scoped wider than this one service.

use http::HeaderValue;

/// Rewrites every `Set-Cookie` header value in place. `path_prefix` should
/// already be normalized (leading slash, no trailing slash, `""` for root).
pub fn apply(values: &mut [HeaderValue], path_prefix: &str, request_host: &str) {
    if path_prefix.is_empty() || path_prefix == "/" {
        return;
    }
    for value in values.iter_mut() {
        if let Ok(raw) = value.to_str() {
            if let Some(rewritten) = rewrite_one(raw, path_prefix, request_host) {
                if let Ok(v) = HeaderValue::from_str(&rewritten) {
                    *value = v;
                }
            }
        }
    }
}

fn rewrite_one(raw: &str, path_prefix: &str, request_host: &str) -> Option<String> {
    let mut parts: Vec<String> = raw.split(';').map(str::to_string).collect();
    if parts.is_empty() {
        return None;
    }

    if let Some(domain) = find_attr(&parts, "domain") {
        if !domain.eq_ignore_ascii_case(request_host) {
            return None;
        }
    }

    let existing_path = find_attr(&parts, "path").unwrap_or_else(|| "/".to_string());
    let new_path = join_path(path_prefix, &existing_path);

    let path_attr_idx = parts
        .iter()
        .position(|p| p.trim().get(..4).map(|s| s.eq_ignore_ascii_case("path")).unwrap_or(false));
    let new_attr = format!(" Path={}", new_path);
    match path_attr_idx {
        Some(idx) => parts[idx] = new_attr,
        None => parts.push(new_attr),
    }
    Some(parts.join(";"))
}

fn find_attr(parts: &[String], name: &str) -> Option<String> {
    parts.iter().find_map(|p| {
        let p = p.trim();
        let (key, value) = p.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn join_path(prefix: &str, existing: &str) -> String {
    if existing == "/" {
        prefix.to_string()
    } else if existing.starts_with(prefix) {
        existing.to_string()
    } else {
        format!("{}{}", prefix, existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_root_path_to_prefix() {
        let mut values = vec![HeaderValue::from_static("session=abc; Path=/; HttpOnly")];
        apply(&mut values, "/blog", "example.com");
        assert!(values[0].to_str().unwrap().contains("Path=/blog"));
    }

    #[test]
    fn leaves_foreign_domain_untouched() {
        let mut values = vec![HeaderValue::from_static("session=abc; Path=/; Domain=other.com")];
        apply(&mut values, "/blog", "example.com");
        assert!(values[0].to_str().unwrap().contains("Path=/"));
        assert!(!values[0].to_str().unwrap().contains("Path=/blog"));
    }

    #[test]
    fn matches_domain_exactly_equal_to_request_host() {
        let mut values = vec![HeaderValue::from_static("session=abc; Path=/; Domain=example.com")];
        apply(&mut values, "/blog", "example.com");
        assert!(values[0].to_str().unwrap().contains("Path=/blog"));
    }

    #[test]
    fn root_mounted_service_is_unchanged() {
        let mut values = vec![HeaderValue::from_static("session=abc; Path=/")];
        apply(&mut values, "/", "example.com");
        assert!(values[0].to_str().unwrap().contains("Path=/"));
        assert!(!values[0].to_str().unwrap().contains("Path=//"));
    }
}

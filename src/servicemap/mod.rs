//! `(host, path-prefix) -> service` with wildcard subdomain and default
//! fallbacks. Readers see an atomically published, immutable snapshot —
//! publication never mutates a map readers may be holding.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ServiceMapEntry {
    pub path_prefix: String,
    pub service_name: String,
}

type Bucket = Vec<ServiceMapEntry>;
type Map = HashMap<String, Bucket>;

pub struct ServiceMap {
    inner: ArcSwap<Map>,
}

impl Default for ServiceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMap {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Map::new()),
        }
    }

    /// Returns the conflicting service name, if any, for `(host, path)`
    /// pairs already owned by a different service. Used at deploy time to
    /// surface `HostInUse`.
    pub fn check_availability(&self, name: &str, hosts: &[String], paths: &[String]) -> Option<String> {
        let map = self.inner.load();
        let host_keys = Self::bucket_keys(hosts);
        for host in &host_keys {
            let Some(bucket) = map.get(host) else { continue };
            for path in paths {
                if let Some(entry) = bucket.iter().find(|e| &e.path_prefix == path) {
                    if entry.service_name != name {
                        return Some(entry.service_name.clone());
                    }
                }
            }
        }
        None
    }

    /// Publishes a new snapshot with `name`'s entries replaced (or added).
    /// Hosts/paths are normalized by the caller; an empty `hosts` list
    /// means the default (`""`) bucket.
    pub fn set(&self, name: &str, hosts: &[String], paths: &[String]) {
        let mut next: Map = (**self.inner.load()).clone();
        for bucket in next.values_mut() {
            bucket.retain(|e| e.service_name != name);
        }
        let host_keys = Self::bucket_keys(hosts);
        for host in &host_keys {
            let bucket = next.entry(host.clone()).or_default();
            for path in paths {
                bucket.push(ServiceMapEntry {
                    path_prefix: path.clone(),
                    service_name: name.to_string(),
                });
            }
            bucket.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        }
        next.retain(|_, bucket| !bucket.is_empty());
        self.inner.store(Arc::new(next));
    }

    pub fn remove(&self, name: &str) {
        let mut next: Map = (**self.inner.load()).clone();
        for bucket in next.values_mut() {
            bucket.retain(|e| e.service_name != name);
        }
        next.retain(|_, bucket| !bucket.is_empty());
        self.inner.store(Arc::new(next));
    }

    /// Exact host → `*.<suffix>` wildcard → default `""` bucket; within the
    /// matched bucket, the first boundary-aligned prefix match wins (the
    /// bucket is kept sorted longest-prefix-first).
    pub fn lookup(&self, host: &str, path: &str) -> Option<String> {
        let map = self.inner.load();

        if let Some(bucket) = map.get(host) {
            if let Some(name) = Self::match_bucket(bucket, path) {
                return Some(name);
            }
        }

        if let Some(dot) = host.find('.') {
            let wildcard_key = format!("*{}", &host[dot..]);
            if let Some(bucket) = map.get(&wildcard_key) {
                if let Some(name) = Self::match_bucket(bucket, path) {
                    return Some(name);
                }
            }
        }

        map.get("").and_then(|bucket| Self::match_bucket(bucket, path))
    }

    /// True iff the map has any entry at all for `host` (exact, wildcard,
    /// or default) — `ServeHTTP` returns a bare 404 when this is false.
    pub fn has_any_entry_for(&self, host: &str) -> bool {
        let map = self.inner.load();
        if map.contains_key(host) {
            return true;
        }
        if let Some(dot) = host.find('.') {
            if map.contains_key(&format!("*{}", &host[dot..])) {
                return true;
            }
        }
        map.contains_key("")
    }

    /// Like `lookup`, but also returns the matched path prefix — the
    /// service pipeline needs it to decide whether to strip it from the
    /// forwarded request path.
    pub fn lookup_with_prefix(&self, host: &str, path: &str) -> Option<(String, String)> {
        let map = self.inner.load();

        if let Some(bucket) = map.get(host) {
            if let Some(entry) = Self::match_bucket_entry(bucket, path) {
                return Some(entry);
            }
        }
        if let Some(dot) = host.find('.') {
            let wildcard_key = format!("*{}", &host[dot..]);
            if let Some(bucket) = map.get(&wildcard_key) {
                if let Some(entry) = Self::match_bucket_entry(bucket, path) {
                    return Some(entry);
                }
            }
        }
        map.get("").and_then(|bucket| Self::match_bucket_entry(bucket, path))
    }

    fn match_bucket(bucket: &[ServiceMapEntry], path: &str) -> Option<String> {
        bucket
            .iter()
            .find(|e| boundary_prefix_matches(&e.path_prefix, path))
            .map(|e| e.service_name.clone())
    }

    fn match_bucket_entry(bucket: &[ServiceMapEntry], path: &str) -> Option<(String, String)> {
        bucket
            .iter()
            .find(|e| boundary_prefix_matches(&e.path_prefix, path))
            .map(|e| (e.path_prefix.clone(), e.service_name.clone()))
    }

    fn bucket_keys(hosts: &[String]) -> Vec<String> {
        if hosts.is_empty() {
            vec![String::new()]
        } else {
            hosts.to_vec()
        }
    }
}

/// `path_prefix` (with a trailing slash appended) must be a prefix of
/// `path` (with a trailing slash appended) — this is what stops `/app` from
/// matching `/application`. The root prefix `/` always matches.
pub fn boundary_prefix_matches(path_prefix: &str, path: &str) -> bool {
    if path_prefix == "/" {
        return true;
    }
    let prefix_slashed = if path_prefix.ends_with('/') {
        path_prefix.to_string()
    } else {
        format!("{}/", path_prefix)
    };
    let path_slashed = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    };
    path_slashed.starts_with(&prefix_slashed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_beats_wildcard_and_default() {
        let map = ServiceMap::new();
        map.set("default", &[], &["/".to_string()]);
        map.set("s1", &["s1.example.com".to_string()], &["/".to_string()]);
        assert_eq!(map.lookup("s1.example.com", "/"), Some("s1".to_string()));
        assert_eq!(map.lookup("s2.example.com", "/"), Some("default".to_string()));
    }

    #[test]
    fn wildcard_subdomain_matches() {
        let map = ServiceMap::new();
        map.set("beta", &["*.first.example.com".to_string()], &["/".to_string()]);
        assert_eq!(
            map.lookup("app.first.example.com", "/"),
            Some("beta".to_string())
        );
    }

    #[test]
    fn longest_prefix_with_boundary_alignment() {
        let map = ServiceMap::new();
        map.set("a", &["x".to_string()], &["/".to_string()]);
        map.set("b", &["x".to_string()], &["/app".to_string()]);
        map.set("c", &["x".to_string()], &["/api/internal".to_string()]);

        assert_eq!(map.lookup("x", "/app/show"), Some("b".to_string()));
        assert_eq!(map.lookup("x", "/api/internal/x"), Some("c".to_string()));
        assert_eq!(map.lookup("x", "/appointment"), Some("a".to_string()));
    }

    #[test]
    fn check_availability_reports_conflict() {
        let map = ServiceMap::new();
        map.set("a", &["x".to_string()], &["/".to_string()]);
        let conflict = map.check_availability("b", &["x".to_string()], &["/".to_string()]);
        assert_eq!(conflict, Some("a".to_string()));
        assert!(map.check_availability("a", &["x".to_string()], &["/".to_string()]).is_none());
    }

    #[test]
    fn remove_clears_all_entries_for_name() {
        let map = ServiceMap::new();
        map.set("a", &["x".to_string()], &["/".to_string()]);
        map.remove("a");
        assert_eq!(map.lookup("x", "/"), None);
        assert!(!map.has_any_entry_for("x"));
    }

    #[test]
    fn redeploy_of_same_service_replaces_entries_atomically() {
        let map = ServiceMap::new();
        map.set("a", &["x".to_string()], &["/old".to_string()]);
        map.set("a", &["x".to_string()], &["/new".to_string()]);
        assert_eq!(map.lookup("x", "/old"), None);
        assert_eq!(map.lookup("x", "/new"), Some("a".to_string()));
    }
}

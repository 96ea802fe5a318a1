//! Groups service hostnames by registrable domain, for certificate batching
//! decisions that live outside this crate (TLS/ACME provisioning is not
//! implemented here) — this module only produces the grouping identifiers.

use std::collections::BTreeMap;

/// Deterministic identifier for a group: `single:<domain>` when the group
/// has exactly one host, `san:<root>` when multiple hosts share a
/// registrable domain.
pub fn group(hosts: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut by_root: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for host in hosts {
        let normalized = host.to_ascii_lowercase();
        let root = registrable_domain(&normalized);
        let bucket = by_root.entry(root).or_default();
        if !bucket.contains(&normalized) {
            bucket.push(normalized);
        }
    }

    let mut groups = BTreeMap::new();
    for (root, mut members) in by_root {
        members.sort();
        let id = if members.len() == 1 {
            format!("single:{}", members[0])
        } else {
            format!("san:{}", root)
        };
        groups.insert(id, members);
    }
    groups
}

/// Last two labels, e.g. `app.example.com` -> `example.com`. Hosts with
/// fewer than two labels (bare `localhost`, IP literals) are their own
/// root.
fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_host_gets_single_identifier() {
        let groups = group(&["app.example.com".to_string()]);
        assert!(groups.contains_key("single:app.example.com"));
    }

    #[test]
    fn subdomains_of_same_apex_share_a_san_group() {
        let groups = group(&["a.example.com".to_string(), "b.example.com".to_string()]);
        assert_eq!(groups.len(), 1);
        let (id, members) = groups.iter().next().unwrap();
        assert_eq!(id, "san:example.com");
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn distinct_apex_domains_stay_separate() {
        let groups = group(&["example.com".to_string(), "other.org".to_string()]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn dedups_case_insensitively() {
        let groups = group(&["Example.com".to_string(), "example.com".to_string()]);
        assert_eq!(groups.len(), 1);
        let members = groups.values().next().unwrap();
        assert_eq!(members.len(), 1);
    }
}

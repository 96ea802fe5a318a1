//! Deterministic percentage-based traffic split for canary rollouts.
//! Given a stable per-client token (cookie value, or a fresh random one),
//! hashes it and compares against the configured split so the same client
//! keeps landing in the same bucket across requests.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

fn fnv1a_32(input: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub cookie_name: String,
    /// 0-100. 0 disables rollout entirely (all traffic to the active
    /// target); 100 sends all traffic to the rollout target.
    pub percentage: u8,
    /// Cookie values always routed to the rollout target, bypassing the
    /// hash decision — used to pin a known tester into the canary.
    pub allow_list: Vec<String>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            cookie_name: "kamal-rollout".to_string(),
            percentage: 0,
            allow_list: Vec::new(),
        }
    }
}

/// True iff `token` should be routed to the rollout target.
pub fn should_route_to_rollout(config: &RolloutConfig, token: &str) -> bool {
    if config.allow_list.iter().any(|allowed| allowed == token) {
        return true;
    }
    if config.percentage == 0 {
        return false;
    }
    if config.percentage >= 100 {
        return true;
    }
    let threshold = ((config.percentage as u64) * (u32::MAX as u64 + 1) / 100) as u32;
    fnv1a_32(token) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_percent_never_routes_to_rollout() {
        let config = RolloutConfig { percentage: 0, ..Default::default() };
        for i in 0..50 {
            assert!(!should_route_to_rollout(&config, &format!("client-{i}")));
        }
    }

    #[test]
    fn hundred_percent_always_routes_to_rollout() {
        let config = RolloutConfig { percentage: 100, ..Default::default() };
        for i in 0..50 {
            assert!(should_route_to_rollout(&config, &format!("client-{i}")));
        }
    }

    #[test]
    fn allow_list_bypasses_percentage() {
        let config = RolloutConfig {
            percentage: 0,
            allow_list: vec!["vip-token".to_string()],
            ..Default::default()
        };
        assert!(should_route_to_rollout(&config, "vip-token"));
    }

    #[test]
    fn decision_is_stable_for_same_token() {
        let config = RolloutConfig { percentage: 50, ..Default::default() };
        let first = should_route_to_rollout(&config, "stable-client");
        let second = should_route_to_rollout(&config, "stable-client");
        assert_eq!(first, second);
    }

    #[test]
    fn roughly_splits_population_at_fifty_percent() {
        let config = RolloutConfig { percentage: 50, ..Default::default() };
        let routed = (0..2000)
            .filter(|i| should_route_to_rollout(&config, &format!("client-{i}")))
            .count();
        assert!((800..1200).contains(&routed), "got {routed} of 2000");
    }
}

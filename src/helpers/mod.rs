pub mod cookie_scope;
pub mod domain_grouper;
pub mod reproxy;
pub mod rollout;

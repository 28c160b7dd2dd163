//! Caller identity and bucket authorization
//!
//! Session tokens are issued elsewhere (the OIDC login flow); this module only
//! verifies them and decides bucket access from the caller's groups.

pub mod session;

pub use session::*;

use crate::config::BucketConfig;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub name: Option<String>,
    pub groups: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>, groups: Vec<String>) -> Self {
        Principal {
            subject: subject.into(),
            name: None,
            groups,
        }
    }
}

/// Whether a caller in `groups` may use `bucket`.
///
/// Members of the bucket's group and of `admin_group` are allowed.
pub fn authorize(groups: &[String], bucket: &BucketConfig, admin_group: &str) -> bool {
    groups
        .iter()
        .any(|group| group == &bucket.group || group == admin_group)
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::rib::Path;
use crate::utils::nlri_to_addr;

/// Terminal result of a matched policy statement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    Reject,
}

impl Default for PolicyAction {
    fn default() -> Self {
        PolicyAction::Accept
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyAction::Accept => write!(f, "accept"),
            PolicyAction::Reject => write!(f, "reject"),
        }
    }
}

/// One match/action rule inside a policy
#[derive(Clone, Debug, Deserialize)]
pub struct PolicyStatement {
    /// Prefixes this statement covers; a path matches when its NLRI is
    /// contained by any of them
    pub prefixes: Vec<IpNetwork>,
    #[serde(default)]
    pub action: PolicyAction,
    pub set_local_pref: Option<u32>,
    pub set_med: Option<u32>,
}

impl PolicyStatement {
    fn matches(&self, path: &Path) -> bool {
        let (addr, length) = match nlri_to_addr(&path.nlri) {
            Some(found) => found,
            None => return false,
        };
        self.prefixes
            .iter()
            .any(|network| network.contains(addr) && network.prefix() <= length)
    }

    fn apply(&self, path: &Path) -> Path {
        let mut path = path.clone();
        if self.set_local_pref.is_some() || self.set_med.is_some() {
            let mut attributes = (*path.attributes).clone();
            if let Some(local_pref) = self.set_local_pref {
                attributes.local_pref = Some(local_pref);
            }
            if let Some(med) = self.set_med {
                attributes.multi_exit_disc = Some(med);
            }
            path.attributes = Arc::new(attributes);
        }
        path
    }
}

/// A named, ordered list of statements
#[derive(Clone, Debug, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub statements: Vec<PolicyStatement>,
}

impl Policy {
    /// First matching statement wins; `None` when nothing matched
    pub fn apply(&self, path: &Path) -> Option<(PolicyAction, Path)> {
        for statement in &self.statements {
            if statement.matches(path) {
                return Some((statement.action, statement.apply(path)));
            }
        }
        None
    }
}

pub type PolicyMap = HashMap<String, Arc<Policy>>;

/// Resolve configured policy names against a policy map, silently skipping
/// names the map does not know.
pub fn resolve_policies(names: &[String], map: &PolicyMap) -> Vec<Arc<Policy>> {
    names
        .iter()
        .filter_map(|name| map.get(name).cloned())
        .collect()
}

/// Walk a policy chain in order.
///
/// Returns `(applied, new_path)`: the first policy that matches decides.
/// A reject yields `(true, None)` and stops the chain, anything else yields
/// `(true, Some(rewritten))`. When no policy matches, the original path
/// comes back untouched as `(false, Some(path))` and the caller consults
/// its default verdict.
pub fn apply_policies(chain: &[Arc<Policy>], path: &Path) -> (bool, Option<Path>) {
    for policy in chain {
        if let Some((action, new_path)) = policy.apply(path) {
            return match action {
                PolicyAction::Reject => (true, None),
                PolicyAction::Accept => (true, Some(new_path)),
            };
        }
    }
    (false, Some(path.clone()))
}

/// Chain application plus the default-verdict rule: an empty chain passes
/// paths unchanged; the default verdict only governs the
/// policies-present-but-none-matched case.
pub fn filter_path(chain: &[Arc<Policy>], default: PolicyAction, path: &Path) -> Option<Path> {
    if chain.is_empty() {
        return Some(path.clone());
    }
    match apply_policies(chain, path) {
        (true, result) => result,
        (false, original) => match default {
            PolicyAction::Accept => original,
            PolicyAction::Reject => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::{Family, PathAttributes, PeerInfo};
    use crate::utils::prefix_from_str;
    use bgp_rs::{NLRIEncoding, AFI, SAFI};

    fn test_path(prefix: &str) -> Path {
        let source = PeerInfo::new(
            65001,
            "2.2.2.2".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        );
        let mut attributes = PathAttributes::default();
        attributes.next_hop = Some(source.address);
        Path::new(
            Family::new(AFI::IPV4, SAFI::Unicast),
            NLRIEncoding::IP(prefix_from_str(prefix).unwrap()),
            Arc::new(attributes),
            source,
            false,
        )
    }

    fn reject_policy(name: &str, prefix: &str) -> Arc<Policy> {
        Arc::new(Policy {
            name: name.to_string(),
            statements: vec![PolicyStatement {
                prefixes: vec![prefix.parse().unwrap()],
                action: PolicyAction::Reject,
                set_local_pref: None,
                set_med: None,
            }],
        })
    }

    fn accept_policy(name: &str, prefix: &str, local_pref: Option<u32>) -> Arc<Policy> {
        Arc::new(Policy {
            name: name.to_string(),
            statements: vec![PolicyStatement {
                prefixes: vec![prefix.parse().unwrap()],
                action: PolicyAction::Accept,
                set_local_pref: local_pref,
                set_med: None,
            }],
        })
    }

    #[test]
    fn test_reject_short_circuits() {
        let chain = vec![
            reject_policy("deny-ten", "10.0.0.0/8"),
            accept_policy("allow-ten", "10.0.0.0/8", Some(500)),
        ];
        let (applied, result) = apply_policies(&chain, &test_path("10.1.0.0/16"));
        assert!(applied);
        assert!(result.is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let chain = vec![
            accept_policy("pref-up", "10.0.0.0/8", Some(500)),
            reject_policy("deny-ten", "10.0.0.0/8"),
        ];
        let (applied, result) = apply_policies(&chain, &test_path("10.1.0.0/16"));
        assert!(applied);
        let path = result.unwrap();
        assert_eq!(path.attributes.local_pref, Some(500));
    }

    #[test]
    fn test_no_match_returns_original() {
        let chain = vec![reject_policy("deny-ten", "10.0.0.0/8")];
        let path = test_path("172.16.0.0/16");
        let (applied, result) = apply_policies(&chain, &path);
        assert!(!applied);
        let unchanged = result.unwrap();
        assert_eq!(unchanged.key(), path.key());
        assert_eq!(
            unchanged.attributes.local_pref,
            path.attributes.local_pref
        );
    }

    #[test]
    fn test_filter_path_default_verdicts() {
        let chain = vec![reject_policy("deny-ten", "10.0.0.0/8")];
        let path = test_path("172.16.0.0/16");
        assert!(filter_path(&chain, PolicyAction::Accept, &path).is_some());
        assert!(filter_path(&chain, PolicyAction::Reject, &path).is_none());

        // An empty chain passes regardless of the default verdict
        assert!(filter_path(&[], PolicyAction::Reject, &path).is_some());
    }

    #[test]
    fn test_more_specific_only() {
        // A /8 statement does not catch a shorter (less specific) prefix
        let chain = vec![reject_policy("deny-ten", "10.0.0.0/8")];
        let path = test_path("10.0.0.0/7");
        let (applied, _) = apply_policies(&chain, &path);
        assert!(!applied);
    }

    #[test]
    fn test_resolve_policies_skips_unknown() {
        let mut map = PolicyMap::new();
        map.insert(
            "known".to_string(),
            reject_policy("known", "10.0.0.0/8"),
        );
        let resolved = resolve_policies(
            &["known".to_string(), "missing".to_string()],
            &map,
        );
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "known");
    }
}

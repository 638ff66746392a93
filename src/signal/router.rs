// =============================================================================
// Signal Router — strategy_tag -> account_ids (C9)
// =============================================================================
//
// Pure lookup; never touches sessions. An absent tag routes to a configured
// default set (possibly empty) — unknown strategies never implicitly fan out
// to every account.
// =============================================================================

use std::collections::HashMap;

use crate::types::AccountId;

pub struct SignalRouter {
    strategy_map: HashMap<String, Vec<AccountId>>,
    default_accounts: Vec<AccountId>,
}

impl SignalRouter {
    pub fn new(strategy_map: HashMap<String, Vec<AccountId>>, default_accounts: Vec<AccountId>) -> Self {
        Self {
            strategy_map,
            default_accounts,
        }
    }

    /// Route `strategy_tag` to its configured accounts, or the default set
    /// if the tag is absent or `None`.
    pub fn route(&self, strategy_tag: Option<&str>) -> Vec<AccountId> {
        match strategy_tag {
            Some(tag) => self
                .strategy_map
                .get(tag)
                .cloned()
                .unwrap_or_else(|| self.default_accounts.clone()),
            None => self.default_accounts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc(s: &str) -> AccountId {
        AccountId::from(s)
    }

    #[test]
    fn known_strategy_routes_to_its_mapped_accounts() {
        let mut map = HashMap::new();
        map.insert("momentum".to_string(), vec![acc("alpha"), acc("bravo")]);
        let router = SignalRouter::new(map, vec![]);
        assert_eq!(router.route(Some("momentum")), vec![acc("alpha"), acc("bravo")]);
    }

    #[test]
    fn unknown_strategy_routes_to_default_not_all_accounts() {
        let mut map = HashMap::new();
        map.insert("momentum".to_string(), vec![acc("alpha")]);
        let router = SignalRouter::new(map, vec![acc("default-only")]);
        assert_eq!(router.route(Some("unknown-tag")), vec![acc("default-only")]);
    }

    #[test]
    fn absent_tag_routes_to_default() {
        let router = SignalRouter::new(HashMap::new(), vec![acc("default-only")]);
        assert_eq!(router.route(None), vec![acc("default-only")]);
    }

    #[test]
    fn empty_default_set_is_a_valid_routing_empty_result() {
        let router = SignalRouter::new(HashMap::new(), vec![]);
        assert!(router.route(None).is_empty());
    }
}

//! Visitor introspection: who is currently tracked, and with how much
//! budget left.

use std::collections::BTreeSet;

use crate::ip;
use crate::key::Key;
use crate::limiter::Limiter;

/// Keys stored as `i64` are assumed to be encoded IPv4 addresses and are
/// rendered dotted-quad; everything else renders as-is.
fn render_key(key: &Key) -> String {
    match key {
        Key::I64(v) => ip::i64_to_ip4(*v),
        other => other.to_string(),
    }
}

impl Limiter {
    /// Every visitor currently tracked by any rule, deduplicated and sorted
    /// ascending.
    pub fn current_online_users(&self) -> Vec<String> {
        let mut users = BTreeSet::new();
        for rule in &self.rules {
            for key in rule.online_keys() {
                users.insert(render_key(&key));
            }
        }
        users.into_iter().collect()
    }

    /// Per-visitor remaining budgets, one row per visitor: the rendered key
    /// followed by the remaining count for each rule (ascending window), all
    /// as strings. At most `max` rows are returned, in visitor order.
    ///
    /// Budgets are looked up by the rendered key, so rows for numeric
    /// visitors (rendered dotted-quad) show untouched budgets.
    pub fn current_online_users_with_detail(&self, max: usize) -> Vec<Vec<String>> {
        assert!(max > 0, "max must be positive");
        let mut rows = Vec::new();
        for user in self.current_online_users() {
            if rows.len() >= max {
                break;
            }
            let remaining = self.remaining_visits(user.as_str());
            let mut row = Vec::with_capacity(1 + remaining.len());
            row.push(user);
            row.extend(remaining.into_iter().map(|n| n.to_string()));
            rows.push(row);
        }
        rows
    }

    /// Number of visitors with live admissions in each rule (ascending
    /// window), after one expiry sweep. Eventually consistent with admission
    /// traffic, not transactional against it.
    pub fn current_online_user_count_per_rule(&self) -> Vec<usize> {
        self.rules
            .iter()
            .map(|rule| rule.current_online_count())
            .collect()
    }
}

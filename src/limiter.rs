//! Multi-window policy: an ordered set of rules evaluated together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::SnapshotError;
use crate::ip;
use crate::key::Key;
use crate::rule::Rule;
use crate::snapshot::{self, AutosaveTask};
use crate::sweep;

const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

/// A multi-window sliding-log rate limiter.
///
/// Configure with [`add_rule`](Limiter::add_rule) (and optionally
/// [`load_and_autosave`](Limiter::load_and_autosave)), then share as
/// `Arc<Limiter>`: admission and introspection take `&self`.
///
/// A visit is admitted only when every rule still has room for the visitor;
/// rules are checked shortest window first and the first rejection wins.
/// Admissions already recorded by shorter-window rules are *not* rolled back
/// when a longer-window rule rejects; the spent credit recovers on its own
/// as those windows slide.
///
/// Configuration misuse (no rules at admission time, adding rules after
/// autosave is active, rule sets whose allowed rate increases with the window,
/// loading twice) is a programming error and panics.
///
/// Rule and autosave configuration spawn background tasks and must run inside
/// a Tokio runtime.
pub struct Limiter {
    pub(crate) rules: Vec<Arc<Rule>>,
    stem: Option<PathBuf>,
    /// Keeps the periodic snapshot task alive; the task only holds a weak
    /// reference and stops once this is dropped.
    #[allow(dead_code)]
    autosave: Option<Arc<AutosaveTask>>,
    save_lock: Arc<Mutex<()>>,
    loaded: bool,
}

impl Limiter {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            stem: None,
            autosave: None,
            save_lock: Arc::new(Mutex::new(())),
            loaded: false,
        }
    }

    /// Add a rule: at most `limit` admissions per visitor per `window`.
    ///
    /// Windows shorter than one second are outside this limiter's design
    /// range; a `limit` of zero is treated as one.
    pub fn add_rule(&mut self, window: Duration, limit: usize) {
        self.add_rule_sized(window, limit, 0);
    }

    /// Like [`add_rule`](Limiter::add_rule), with a hint for how many
    /// visitors are expected per window. The hint sizes the slot pool up
    /// front; zero falls back to `limit`.
    pub fn add_rule_sized(&mut self, window: Duration, limit: usize, expected_visitors: usize) {
        if self.stem.is_some() {
            panic!("add_rule is not allowed once autosave is active");
        }
        let rule = Arc::new(Rule::new(window, limit, expected_visitors));
        tokio::spawn(sweep::run_sweep_loop(Arc::downgrade(&rule)));
        self.rules.push(rule);
        // defend against out-of-order configuration
        self.rules.sort_by_key(|r| r.window);
        self.validate_densities();
    }

    /// A longer window must not allow a higher rate than a shorter one;
    /// such a rule could never be the binding constraint.
    fn validate_densities(&self) {
        for pair in self.rules.windows(2) {
            let (shorter, longer) = (&pair[0], &pair[1]);
            let short_rate = shorter.limit as f64 / shorter.window.as_nanos() as f64;
            let long_rate = longer.limit as f64 / longer.window.as_nanos() as f64;
            if long_rate > short_rate {
                panic!(
                    "invalid rule set: {} visits per {:?} allows a higher rate than {} visits per {:?}",
                    longer.limit, longer.window, shorter.limit, shorter.window
                );
            }
        }
    }

    /// Record one visit for `key`. Returns `true` when every rule admitted
    /// it, `false` as soon as one rejects.
    pub fn allow_visit(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        if self.rules.is_empty() {
            panic!("no rules configured; call add_rule first");
        }
        self.rules.iter().all(|rule| rule.allow_visit(&key))
    }

    /// Record one visit for a dotted-quad IPv4 address, stored as its integer
    /// form. Unparseable addresses are rejected without touching any rule,
    /// and so is `0.0.0.0`, which shares the decoder's failure sentinel.
    pub fn allow_visit_ipv4(&self, ip: &str) -> bool {
        let encoded = ip::ip4_to_i64(ip);
        if encoded == 0 {
            return false;
        }
        self.allow_visit(encoded)
    }

    /// Remaining admissions for `key`, one entry per rule in ascending window
    /// order.
    pub fn remaining_visits(&self, key: impl Into<Key>) -> Vec<usize> {
        let key = key.into();
        self.rules.iter().map(|rule| rule.remaining(&key)).collect()
    }

    /// Remaining admissions under the largest-window rule only.
    pub fn remaining_visit(&self, key: impl Into<Key>) -> usize {
        let Some(rule) = self.rules.last() else {
            panic!("no rules configured; call add_rule first");
        };
        rule.remaining(&key.into())
    }

    /// Per-rule remaining admissions for an IPv4 visitor; empty when the
    /// address does not parse.
    pub fn remaining_visits_ipv4(&self, ip: &str) -> Vec<usize> {
        let encoded = ip::ip4_to_i64(ip);
        if encoded == 0 {
            return Vec::new();
        }
        self.remaining_visits(encoded)
    }

    /// Drop all recorded visits for `key` in every rule, e.g. to lift a limit
    /// for one client by hand.
    pub fn manual_clear(&self, key: impl Into<Key>) {
        let key = key.into();
        for rule in &self.rules {
            rule.manual_clear(&key);
        }
    }

    /// Drop all recorded visits for every visitor.
    pub fn manual_clear_all(&self) {
        for rule in &self.rules {
            rule.manual_clear_all();
        }
    }

    /// Restore state from `<stem>.ratelimit` if present, then write a fresh
    /// snapshot there every 60 seconds.
    ///
    /// See [`load_and_autosave_every`](Limiter::load_and_autosave_every).
    pub fn load_and_autosave(&mut self, stem: impl Into<PathBuf>) -> Result<(), SnapshotError> {
        self.load_and_autosave_every(stem, DEFAULT_AUTOSAVE_INTERVAL)
    }

    /// Restore state from `<stem>.ratelimit` if present, then write a fresh
    /// snapshot there every `interval`.
    ///
    /// A missing file is fine: the limiter starts empty and autosave is still
    /// activated. On a validation error the admissions restored before the
    /// bad record stay in place. After this call the rule set is frozen;
    /// calling it a second time on the same limiter panics.
    pub fn load_and_autosave_every(
        &mut self,
        stem: impl Into<PathBuf>,
        interval: Duration,
    ) -> Result<(), SnapshotError> {
        if self.rules.is_empty() {
            panic!("no rules configured; call add_rule first");
        }
        if self.loaded {
            panic!("load_and_autosave may only be called once");
        }
        let stem = stem.into();
        if stem.as_os_str().is_empty() {
            panic!("snapshot path stem is empty");
        }
        self.loaded = true;
        self.stem = Some(stem.clone());

        let result = snapshot::load(&self.rules, &stem);

        let task = Arc::new(AutosaveTask {
            rules: self.rules.clone(),
            stem,
            save_lock: self.save_lock.clone(),
        });
        tokio::spawn(snapshot::run_autosave_loop(Arc::downgrade(&task), interval));
        self.autosave = Some(task);

        result
    }

    /// Write one snapshot to the stem configured by
    /// [`load_and_autosave`](Limiter::load_and_autosave).
    pub fn save_once(&self) -> Result<(), SnapshotError> {
        if self.rules.is_empty() {
            panic!("no rules configured; call add_rule first");
        }
        let Some(stem) = &self.stem else {
            return Err(SnapshotError::NoPath);
        };
        let _guard = self.save_lock.lock();
        snapshot::save(&self.rules, stem)
    }

    /// Write one snapshot to an explicit path stem, without activating
    /// autosave.
    pub fn save_once_to(&self, stem: impl AsRef<Path>) -> Result<(), SnapshotError> {
        if self.rules.is_empty() {
            panic!("no rules configured; call add_rule first");
        }
        let _guard = self.save_lock.lock();
        snapshot::save(&self.rules, stem.as_ref())
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

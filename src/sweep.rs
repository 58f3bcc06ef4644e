//! Background cleanup task, one per rule.

use std::sync::Weak;

use crate::rule::Rule;

/// Sweep expired admissions and compact the slot pool on the rule's cleanup
/// interval.
///
/// The task holds only a weak reference: once the owning limiter is dropped,
/// the next tick fails to upgrade and the loop ends.
pub(crate) async fn run_sweep_loop(rule: Weak<Rule>) {
    let Some(interval) = rule.upgrade().map(|r| r.cleanup_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick

    loop {
        ticker.tick().await;
        let Some(rule) = rule.upgrade() else {
            break;
        };
        rule.sweep_cycle();
    }
}

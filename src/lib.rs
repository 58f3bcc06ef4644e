//! Multi-window sliding-log rate limiting for in-process services.
//!
//! Each visitor (string or integer key, or an encoded IPv4 address) is held
//! to one or more rules of the form "at most N visits per window W". A visit
//! is admitted only when every rule still has room. Per-visitor admission
//! deadlines live in fixed-capacity rings inside a slot pool that recycles
//! and compacts itself as visitors come and go, and the whole state can be
//! periodically snapshotted to disk and restored across restarts.
//!
//! Windows are expected to be at least one second; burst shaping at
//! sub-second granularity is a token bucket's job, not this crate's.
//!
//! ```no_run
//! use std::time::Duration;
//! use floodgate::Limiter;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut limiter = Limiter::new();
//!     limiter.add_rule(Duration::from_secs(10), 2);
//!     limiter.add_rule(Duration::from_secs(3600), 100);
//!     limiter.load_and_autosave("visits").unwrap();
//!
//!     assert!(limiter.allow_visit("alice"));
//!     assert!(limiter.allow_visit_ipv4("203.0.113.7"));
//! }
//! ```

mod clock;
mod error;
mod ip;
mod key;
mod limiter;
mod ring;
mod rule;
mod snapshot;
mod stats;
mod sweep;

pub use error::SnapshotError;
pub use ip::{i64_to_ip4, ip4_to_i64};
pub use key::Key;
pub use limiter::Limiter;

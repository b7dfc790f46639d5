//! Process-wide security policy: command filtering, auth rate limiting, and
//! the scoped sudo password cache.
//!
//! All three are owned by [`crate::server::Server`] and swapped atomically on
//! config hot-reload — there are no ambient singletons.

pub mod filter;
pub mod ratelimit;
pub mod sudo;

pub use filter::CommandFilter;
pub use ratelimit::AuthRateLimiter;
pub use sudo::SudoCache;

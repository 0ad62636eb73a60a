// Resilience primitives shared by every request path.
// None of these depend on each other; each owns exactly one lock.

pub mod rate_limiter;
pub mod retry;
pub mod session_cache;
pub mod timeout;

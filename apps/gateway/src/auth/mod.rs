// Upstream credentials (refreshable bearer tokens or a static API key) and
// the CAPTCHA check on session creation.

pub mod service_account;
pub mod token_provider;
pub mod turnstile;

//! Request admission for the portfolio site.
//!
//! Every inbound request passes the [`guard::Gateway`]: a guard policy
//! (attack shield, bot detection, token bucket) in LIVE or DRY_RUN mode,
//! then the auth gate for protected routes. Endpoint-specific
//! [`guard::RouteGuard`]s run after that, and only admitted requests are
//! forwarded to the site.

pub mod config;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod server;

mod matcher;
mod path;

pub use matcher::{GatewayMatcher, MethodFilter, PathPatterns};
pub use path::canonical_path;

pub mod context;
pub mod handler;
pub mod upstream;

pub use context::{empty_body, full_body, BoxBody, RequestContext, Stage};
pub use handler::{admit, handle_request, Admitted};
pub use upstream::SiteClient;

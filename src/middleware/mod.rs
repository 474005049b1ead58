pub mod rate_limit;
pub mod validation;

pub use rate_limit::{rate_limit_middleware, RateLimitLayer};
pub use validation::validate_json;

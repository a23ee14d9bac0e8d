pub mod deduplicator;
pub mod execution_policy;
pub mod request_key;

pub use deduplicator::Deduplicator;
pub use execution_policy::ExecutionPolicy;
pub use request_key::{canonical_key, generate_request_key, RequestKeyParams};

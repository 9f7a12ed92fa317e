//! Data models shared by the pool, the JSON pipeline and the repository.

pub mod connection;
pub mod field_type;
pub mod query;
pub mod record;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionMetadata, ConnectionState, PoolStatus};
pub use field_type::FieldType;
pub use query::QueryParam;
pub use record::{FieldDecl, Record, RecordSchema};
pub use value::{FieldMap, FieldValue};

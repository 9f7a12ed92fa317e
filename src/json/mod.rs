//! JSON document handling: which fields are documents, and how they are
//! written and read.

pub mod codec;
pub mod inspector;

pub use codec::JsonCodec;
pub use inspector::{ClassificationOverrides, FieldClassification, FieldKind, TypeInspector};

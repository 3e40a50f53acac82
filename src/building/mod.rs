//! Building model: typed entities and decoding from serialized attributes

pub mod attributes;
pub mod models;

pub use attributes::{AttributeError, AttributeValue, ElementSerializer, SerializedElement};
pub use models::*;

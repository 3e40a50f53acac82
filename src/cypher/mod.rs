//! Cypher generation for building entities

pub mod escape;
pub mod statement;
pub mod translator;

pub use statement::{Assignment, Clause, Direction, NodePattern, PropertyValue, RelType, Statement};
pub use translator::UpsertTranslator;

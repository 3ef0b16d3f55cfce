//! Mapper configuration documents and their versioned lifecycle.

pub mod document;
pub mod store;

pub use document::{
    Action, Condition, ConditionTree, MapperDocument, MapperMetadata, Operator, ParameterSource,
    Priority, Rule, SuggestionTemplate, Transform,
};
pub use store::{MapperConfig, MapperConfigStore, MapperStatus};

pub mod builder;
pub mod dict;
pub mod encoder;
pub mod error;
pub mod fields;
pub mod index;
pub(crate) mod parser;
pub mod queue;
pub mod reader;
pub mod record;
pub mod sort;
pub mod types;
pub mod writer;

//! MaxMind DB reading and writing
//!
//! The compiled reputation database uses the MaxMind DB binary format so
//! that external tooling can read it. Reading goes through the
//! `maxminddb` crate; the writer serializes the format directly since no
//! registry crate produces it.

pub mod reader;
pub mod writer;

pub use reader::{MmdbError, MmdbReader, ReaderStats, ReputationRecord};
pub use writer::{CompileStats, MmdbWriter, ReputationEntry, WriterConfig};

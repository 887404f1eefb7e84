//! Durable storage for batch output.

mod file_store;

pub use file_store::{default_file_name, FileStore, StorageError};

mod entries;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{Entry, EntryFilter, EntryListItem, Feed, ImportStats, Stats, StorageError};

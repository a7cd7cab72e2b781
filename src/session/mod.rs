pub mod file_store;
pub mod store;

pub use file_store::{FileSnapshotStore, read_snapshot};
pub use store::SnapshotStore;

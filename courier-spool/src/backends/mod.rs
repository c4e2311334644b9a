pub mod file;
pub mod memory;

pub use file::{FileStore, FileStoreBuilder};
pub use memory::MemoryStore;
pub use test::TestStore;

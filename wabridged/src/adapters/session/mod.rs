pub mod repo_mem;
pub mod repo_sqlite;

pub use repo_mem::{InMemoryAuthStateRepository, InMemorySessionKeyRepository};
pub use repo_sqlite::{open_database, SqliteAuthStateRepository, SqliteSessionKeyRepository};

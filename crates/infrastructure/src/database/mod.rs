pub mod sqlite;

pub use sqlite::{
    DatabaseManager, SqliteFilterRepository, SqliteMetaStore, SqliteTaskStore,
};

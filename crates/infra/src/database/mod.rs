//! SQLite persistence for unified events, sync cursors and the offline queue.

pub mod cursor_repository;
pub mod event_repository;
pub mod manager;
pub mod operation_repository;
mod support;

pub use cursor_repository::SqliteCursorRepository;
pub use event_repository::SqliteEventRepository;
pub use manager::{DbManager, SqliteConnection};
pub use operation_repository::SqliteOperationRepository;

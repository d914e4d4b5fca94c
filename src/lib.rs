// tasklists - personal task lists over a JSONL journal with an SQLite cache

pub mod config;
pub mod error;
pub mod filter;
pub mod jsonl;
pub mod lists;
pub mod live;
pub mod models;
pub mod record;
pub mod seed;
pub mod store;

// Re-export main types for convenience
pub use config::Config;
pub use error::ListError;
pub use filter::{Filter, FilterOp};
pub use lists::{ListResult, ListStore};
pub use live::{Change, ChangeKind, ChangeSet, LiveResults};
pub use models::{NewTaskList, Task, TaskList, all_done};
pub use record::{IndexValue, Record};
pub use store::{Store, Transaction, now_ms};

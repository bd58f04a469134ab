//! Read-only page access to a possibly-corrupt SQLite database file.

mod pager;

pub use pager::Pager;

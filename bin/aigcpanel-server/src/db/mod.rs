//! Task persistence.
//!
//! The daemon stores tasks in the `data_task` SQLite table shared with the
//! desktop panel. [`sqlite::SqliteTaskStore`] implements the core's
//! [`aigcpanel_core::TaskStore`] seam; swapping databases means implementing
//! that trait for another type and changing the concrete type in `main`.

pub mod sqlite;

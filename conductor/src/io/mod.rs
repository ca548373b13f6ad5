//! Side-effecting operations: filesystem layout, locks, git, processes.

pub mod config;
pub mod error_window;
pub mod git;
pub mod invoker;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod verify;

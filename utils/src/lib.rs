//! Shared infrastructure utilities for crag.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)

pub mod atomic_write;

pub use atomic_write::{PersistMode, atomic_write, atomic_write_with_mode, recover_bak_file};

//! Data-source adapters.
//!
//! - **`memory_source`** – Named points held in memory, used by the binary
//!   when no control process is attached and by the tests.

pub mod memory_source;

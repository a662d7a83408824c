//! Infrastructure layer of the server.
//!
//! Contains the OS-facing adapters: the UDP and TCP sockets, the beacon
//! sender, configuration files and the in-memory data source.
//!
//! **Dependency rule**: this layer may depend on `application` and `pv_core`,
//! but MUST NOT be imported by the `application` layer outside its tests.

pub mod data;
pub mod network;
pub mod storage;

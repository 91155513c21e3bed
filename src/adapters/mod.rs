//! Adapters implementing the domain ports.

pub mod sqlite;

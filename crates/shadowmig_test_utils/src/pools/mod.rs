//! Connections to the PostgreSQL test server.

pub mod postgres;

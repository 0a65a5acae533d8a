//! Docker container management for the test databases.

pub mod lifecycle;

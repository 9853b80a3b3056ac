//! Device integrations and simulated counterparts for tests

pub mod mock;

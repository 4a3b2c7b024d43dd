// Core modules implementing module readiness, process replacement, and error modeling.
pub mod config;
pub mod device;
pub mod diag;
pub mod error;
pub mod exec;
pub mod module;

pub mod admission;
pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod health;
pub mod identity;
pub mod metering;
pub mod observability;
pub mod pool_manager;
pub mod quota;
pub mod rate_limiting;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

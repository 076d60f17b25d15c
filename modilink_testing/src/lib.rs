//! Test helpers for `modilink`.
//!
//! [`FakeBus`] simulates the firmware side of a module network over an
//! in-memory transport, answering discovery and property requests the way
//! real modules do. The logging fixture serialises access to the global
//! `logtest` logger.
//!
//! ```rust
//! use modilink::Session;
//! use modilink_testing::{FakeBus, FakeModule};
//!
//! # async fn example() -> modilink::Result<()> {
//! let (bus, transport) = FakeBus::spawn(vec![FakeModule::network(0x100)]);
//! let session = Session::builder().transport(transport).connect().await?;
//! # drop(bus);
//! session.close().await
//! # }
//! ```

pub mod fake_bus;
pub mod logging;

pub use fake_bus::{FakeBus, FakeModule};
pub use logging::{LoggerHandle, logger};

/// Result alias for tests that use `?` on heterogeneous errors.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

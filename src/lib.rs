#![doc(html_root_url = "https://docs.rs/modilink/latest")]
//! Public API for the `modilink` library.
//!
//! This crate is the host side of a modular hardware network: it frames the
//! JSON messages carried on each transport's byte stream, runs a read and a
//! write loop per transport, keeps a live model of every module's
//! properties and assembles the modules' spatial topology.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod topology;
pub mod transport;
pub mod worker;

pub use config::{ConfigError, SessionConfig, SessionConfigBuilder};
pub use dispatch::Dispatcher;
pub use error::{ModiError, Result, SendError};
pub use frame::FrameBuffer;
pub use message::{Command, MalformedFrame, Message};
pub use metrics::Direction;
pub use registry::{Module, ModuleId, ModuleKind, ModuleRegistry, PropertyType};
pub use session::{Session, SessionBuilder};
pub use topology::{Neighbours, Position, TopologyAssembler, TopologyState};
pub use transport::{Transport, TransportError, TransportId, TransportKind};
pub use worker::{OutboundHandle, TransportEvent, TransportEventKind, TransportWorker};

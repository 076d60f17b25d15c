//! Command line interface for the `modilink` binary.
//!
//! Connects to a module network through a TCP serial bridge and prints the
//! discovered topology. Shared with `build.rs` for man page generation.

use std::time::Duration;

use clap::Parser;

/// Command line arguments for the `modilink` binary.
#[derive(Debug, Parser)]
#[command(
    name = "modilink",
    version,
    about = "Discover the modules attached to a network"
)]
pub struct Cli {
    /// Address of a TCP bridge carrying the network module's byte stream.
    #[arg(long, value_name = "ADDR")]
    pub tcp: String,

    /// Number of modules expected on the bus; waits until all are placed.
    #[arg(short, long, value_name = "N")]
    pub expected: Option<usize>,

    /// Seconds to wait for discovery.
    #[arg(short, long, value_name = "SECS", default_value_t = 5)]
    pub timeout: u64,
}

impl Cli {
    /// Discovery timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout) }
}

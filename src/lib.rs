//! spot-relay - merge locally decoded and skimmer spots into one live feed.
//!
//! This crate provides:
//! - A decoder orchestrator that records per-band cycles and runs external
//!   FT8/FT4/WSPR/CW decoders on them
//! - An async telnet client for a CW skimmer feed, with a nom-based line parser
//! - A fan-out hub that deduplicates, buffers and broadcasts spots to
//!   WebSocket subscribers
//! - Statistics tracking with HDR histograms, served as Prometheus text
//!
//! # Example
//!
//! ```rust,no_run
//! use spot_relay::{parser::parse_spot, spot::SpotKind, stats::PipelineStats};
//!
//! let line = "DX de W1AW-#:   14025.0  K2ABC          15 dB  25 WPM  CQ            1234Z";
//! let spot = parse_spot(line).expect("Failed to parse spot");
//!
//! let stats = PipelineStats::new();
//! stats.record_spot(SpotKind::CwSpot, &spot);
//!
//! println!("{}", stats.summary());
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod geo;
pub mod hub;
pub mod metrics;
pub mod parser;
pub mod server;
pub mod sinks;
pub mod spot;
pub mod stats;

pub use client::{ConnectionState, SkimmerClient, SkimmerClientConfig, SkimmerStatus};
pub use config::Config;
pub use decode::{Decoder, ExternalDecoder, Orchestrator, OrchestratorConfig};
pub use dispatch::{Listeners, SpotDispatcher};
pub use hub::{FanoutHub, HubConfig};
pub use parser::{ParseError, looks_like_spot, parse_spot};
pub use spot::{Mode, Spot, SpotKind};
pub use stats::{PipelineStats, StatsSummary};

#![doc(html_root_url = "https://docs.rs/tspump/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tspump - paced MPEG transport stream output
//!
//! `tspump` writes 188-byte MPEG transport stream packets to a file, to
//! standard output, or over TCP or UDP, and (for UDP) at the rate the
//! stream itself asks for. A producer/consumer engine built around a
//! circular buffer takes its timing from the Program Clock References
//! (PCRs) embedded in the stream, so a transport stream captured from a
//! broadcast plays back onto the network at broadcast speed.
//!
//! ## Features
//!
//! ### Paced UDP output
//! - PCR-locked rate estimation, continuously refined as the stream plays
//! - A credit pool that smooths the rate jitter between adjacent PCRs
//! - Burst protection: at most N packets back-to-back, then an imposed gap
//! - Automatic recovery when the sender falls behind the stream timeline
//!
//! ### Transports
//! - UDP unicast and multicast (with TTL and interface selection)
//! - TCP, with an optional in-band command channel for steering playback
//! - Files and standard output for plain capture
//!
//! ### Front-ends
//! - M2TS (192-byte, timestamped) record reordering
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tspump = "0.1.0"
//! ```
//!
//! ### Paced multicast playback
//!
//! ```rust,no_run
//! use tspump::{PacingConfig, TsWriter};
//!
//! #[tokio::main]
//! async fn main() -> tspump::Result<()> {
//!     let mut writer = TsWriter::open_udp("239.255.1.1", 10000, None).await?;
//!     writer.start_buffering(&PacingConfig::default())?;
//!
//!     // Feed packets from whatever supplies them, tagging each with its
//!     // PID and any PCR it carries (27 MHz ticks).
//!     let packet = [0x47u8; 188];
//!     writer.write(&packet, 0x100, Some(27_000_000)).await?;
//!
//!     // Flushes, signals end of stream, and waits for the pacer to drain.
//!     writer.close().await
//! }
//! ```
//!
//! ### Steered TCP playback
//!
//! ```rust,no_run
//! use tspump::{Command, CommandInput, TsWriter};
//!
//! #[tokio::main]
//! async fn main() -> tspump::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8888").await?;
//!     let mut writer = TsWriter::wait_for_client(&listener).await?;
//!     writer.start_input(CommandInput::OutputSocket)?;
//!
//!     let packet = [0x47u8; 188];
//!     loop {
//!         if writer.command_changed() {
//!             writer.acknowledge_command();
//!             if writer.command() == Command::Quit {
//!                 break;
//!             }
//!         }
//!         writer.write(&packet, 0x100, None).await?;
//!     }
//!     writer.close().await
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`writer`]: the top-level [`TsWriter`], tying sink, buffering and
//!   command channel together
//! - [`buffer`]: the single-producer/single-consumer circular buffer
//!   between the feeder and the pacing task
//! - [`pace`]: the rate controller that stamps items from PCRs, and the
//!   pacing loop that realizes those stamps on the wire
//! - [`sink`]: file, stdout, TCP and UDP destinations
//! - [`command`]: single-character playback commands
//! - [`m2ts`]: reordering front-end for timestamped M2TS records
//! - [`config`]: all the engine's tuning knobs in one place
//! - [`error`]: the crate's error type

pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod m2ts;
pub mod pace;
pub mod sink;
pub mod writer;

pub use command::{Command, CommandInput};
pub use config::{PacingConfig, PerturbConfig};
pub use error::{PumpError, Result};
pub use sink::TsSink;
pub use writer::TsWriter;

/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;

/// Every TS packet starts with this sync byte
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Clock frequency for Program Clock References (PCR) in Hz
pub const PCR_HZ: u64 = 27_000_000;

/// The most TS packets one circular buffer item (and therefore one
/// network packet) may hold: seven is the number guaranteed to fit into a
/// single ethernet frame
pub const MAX_PACKETS_PER_ITEM: usize = 7;

//! # shio-rs
//!
//! Async Rust ingestion and routing core for paired **shio** microphone
//! sensors streaming over Bluetooth Low Energy.
//!
//! Each sensor sends notification packets of packed little-endian `i16`
//! samples.  The crate assigns every device a stable channel number and,
//! depending on the active operating mode, routes each sample to exactly one
//! consumer:
//!
//! | Mode | Consumer |
//! |---|---|
//! | `Idle` | dropped |
//! | `Logging` | one text file per channel (`shio_log_ch{N}.txt`) |
//! | `Plotting` | bounded per-channel display window, flushed in batches |
//! | `Predicting` | fixed-shape windows; when every channel is full the model runs once |
//!
//! ## Quick start
//!
//! ```no_run
//! use shio_rs::prelude::*;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (events, handle, link_tx) = ShioClient::new(ShioClientConfig::default()).start().await?;
//!     let (ui_tx, mut ui_rx) = mpsc::channel(256);
//!     let (cmd_tx, cmd_rx) = mpsc::channel(16);
//!
//!     let config = SessionConfig::default();
//!     let sinks = Box::new(FileSinkFactory::new(&config.log_dir));
//!     let session = Session::new(config, sinks, Box::new(MeanModel), link_tx, ui_tx)?;
//!     tokio::spawn(session.run(events, cmd_rx));
//!
//!     handle.scan().await?;
//!     handle.connect_all().await?;
//!     cmd_tx.send(Command::Mode(ModeCommand::StartLogging)).await?;
//!
//!     while let Some(ev) = ui_rx.recv().await {
//!         println!("{ev:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`shio_client`] | BLE scanning, connecting, subscriptions and role writes |
//! | [`sim`] | Synthetic devices that stand in for the BLE transport |
//! | [`session`] | The event loop tying transport, UI and model together |
//! | [`router`] | Synchronous per-packet routing by mode |
//! | [`registry`] | Device → channel assignment and roles |
//! | [`mode`] | Operating modes and the transition rules |
//! | [`plot`] | Batched, bounded plot windows |
//! | [`inference`] | Inference buffers, the all-full barrier and the model trait |
//! | [`sink`] | Line-oriented output files |
//! | [`types`] | Events, commands and identifiers |
//! | [`protocol`] | GATT UUIDs, role bytes, file names and sizing defaults |
//! | [`parse`] | Packet payload decoding |
//! | [`error`] | The crate error type |

pub mod error;
pub mod inference;
pub mod mode;
pub mod parse;
pub mod plot;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod shio_client;
pub mod sim;
pub mod sink;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::shio_client::{ShioClient, ShioClientConfig, ShioHandle};
    pub use crate::sim::spawn_simulator;

    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::error::ShioError;
    pub use crate::inference::{InferenceInput, InferenceModel, MeanModel};
    pub use crate::mode::{ModeCommand, OperatingMode};
    pub use crate::plot::PlotFlush;
    pub use crate::session::{Session, SessionConfig};
    pub use crate::sink::{FileSinkFactory, FlushPolicy, LineSink, SinkFactory};

    // ── Events and identifiers ────────────────────────────────────────────────
    pub use crate::types::{
        CharacteristicKind, Command, DeviceId, LinkCommand, Role, ShioEvent, UiEvent,
    };
}

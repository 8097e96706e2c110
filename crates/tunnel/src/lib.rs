//! # Diode Tunnel Library
//!
//! Client side of the Diode relay network: one authenticated session to a
//! relay node, multiplexing any number of virtual channels to and from other
//! devices.
//!
//! ## Overview
//!
//! - **Connection Manager**: TLS session, signed usage tickets, request
//!   correlation and lazy reconnects
//! - **RPC Facade**: typed relay commands
//! - **Port Binder**: local TCP ports tunnelled to ports on remote devices
//! - **Port Publisher**: local TCP, UDP and TLS services exposed to remote
//!   devices
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌───────────────┐
//! │ Port Binder  │  │ Port Publisher│
//! └──────┬───────┘  └───────┬───────┘
//!        │  Rpc     ▲       │
//!        ▼          │ ConnectionEvent (broadcast)
//! ┌─────────────────┴───────────────┐
//! │           Connection            │
//! │ Correlator · TicketSigner · TLS │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tunnel::{Connection, ConnectionOptions, Rpc, TicketParams, TicketSigner};
//! use tunnel::transport::{TlsDialer, TlsProfile};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let profile = TlsProfile::new("device_certificate.pem");
//!     let signer = TicketSigner::new(
//!         profile.load_identity()?,
//!         TicketParams {
//!             chain_id: 15,
//!             fleet_contract: "0x6000000000000000000000000000000000000000".parse()?,
//!         },
//!     );
//!     let dialer = TlsDialer::new("eu2.prenet.diode.io", 41046, &profile)?;
//!     let rpc = Rpc::new(Connection::new(dialer, signer, ConnectionOptions::default()));
//!
//!     assert!(rpc.ping().await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`transport`]: Pinned TLS profile and the relay dialer
//! - [`correlator`]: Request ids and pending replies
//! - [`ticket`]: Usage counters, epoch cache and ticket signing
//! - [`connection`]: Session lifecycle and event broadcast
//! - [`rpc`]: Typed relay commands
//! - [`pipe`]: Byte bridges between local streams and channels
//! - [`bind`]: Port binder
//! - [`publish`]: Port publisher

pub mod bind;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod pipe;
pub mod publish;
pub mod rpc;
pub mod ticket;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use bind::{Binding, PortBinder};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, ConnectionState};
pub use publish::{PortPublisher, PublishOptions};
pub use rpc::Rpc;
pub use ticket::{TicketParams, TicketSigner};

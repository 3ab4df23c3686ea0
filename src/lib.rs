//! A LoRa packet-forwarding gateway daemon.
//!
//! `lorastation` bridges one or more SX130x family concentrator chips to a
//! LoRaWAN Network Server (LNS). The daemon owns the radio hardware, schedules
//! downlink transmissions with microsecond precision, streams uplinks to the
//! LNS over WebSocket and accepts configuration/firmware pushes from a CUPS
//! provisioning endpoint.
//!
//! The crate is organised around four subsystems:
//!
//! - [`tc`]: the LNS transport engine. Service discovery over the `INFOS`
//!   endpoint, a persistent `MUXS` WebSocket session and a layered
//!   exponential-backoff reconnect strategy.
//! - [`cups`]: the configuration/update client. An HTTP segment protocol with
//!   ECDSA-verified firmware updates and transactional credential replacement.
//! - [`ral`]: the radio abstraction layer. A master process supervising one
//!   spawned slave process per concentrator chip, talking over pipe-framed
//!   records.
//! - [`timesync`]: drift-filtered conversions between the three time bases
//!   (host microseconds, SX130x extended counter, GPS epoch).
//!
//! Each process is single-threaded and cooperative: the daemon runs all
//! subsystem tasks on a current-thread tokio runtime and the only cross-process
//! synchronisation is the pipe byte stream between master and slaves.

pub mod chan;
pub mod config;
pub mod cups;
pub mod daemon;
pub mod error;
pub mod hal;
pub mod ral;
pub mod s2e;
pub mod sig;
pub mod store;
pub mod tc;
pub mod timesync;
pub mod tls;

/// Maximum number of concentrator chips (= slave processes) per station.
pub const MAX_TXUNITS: usize = 8;

/// Largest LoRa frame payload carried in either direction.
pub const MAX_FRAME_LEN: usize = 255;

/// Upper bound on a stored LNS/CUPS URI, including scheme, port and path.
pub const MAX_URI_LEN: usize = 256;

/// Pipe records must fit a single atomic `write(2)`.
#[cfg(unix)]
pub const PIPE_BUF: usize = libc::PIPE_BUF;

#[cfg(not(unix))]
pub const PIPE_BUF: usize = 4096;

/// Process exit codes for the fatal error classes.
///
/// Everything else is handled locally by the subsystem that observed it and
/// surfaces as log output only.
pub mod exit_code {
    /// A slave observed EOF on its command pipe: the master is gone.
    pub const SLAVE_PIPE_EOF: i32 = 2;

    /// The async runtime could not be brought up.
    pub const EVENT_LOOP: i32 = 10;

    /// Forward recovery over the credential store failed at startup.
    pub const STORE_RECOVERY: i32 = 11;

    /// A slave died more than four times in a row without making progress.
    pub const SLAVE_RESTARTS: i32 = 12;
}

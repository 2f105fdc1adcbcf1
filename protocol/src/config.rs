//! # Configuration & Constants
//!
//! Every tunable of the trading engine lives here: the compile-time
//! constants that define the protocol, and the runtime [`Settings`] tree
//! with the options an operator is expected to touch. Hardcoding one of
//! these values anywhere else in the crate is a bug.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Wire protocol generation. Frames carry no version field; incompatible
/// codecs are separated by the relay port an operator runs. Bump on
/// breaking codec changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Maximum length of a single relay frame body in bytes. A frame beyond
/// this is a protocol violation and the connection is dropped; honest
/// trade messages are a few kilobytes at most.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024;

/// Default relay port. Clients connect here, the broker binds here.
pub const DEFAULT_RELAY_PORT: u16 = 9340;

/// Default metrics (Prometheus) port for the relay node.
pub const DEFAULT_METRICS_PORT: u16 = 9342;

/// On-chain confirmations a deposit needs before the exchange enters the
/// step loop. Two confirmations keeps deposits re-org-safe without making
/// small trades unbearably slow.
pub const DEPOSIT_CONFIRMATIONS: u32 = 2;

/// Block delta after which a deposit's refund clause unlocks. One day of
/// blocks: long enough for any honest exchange, short enough that an
/// aborted trade is not capital locked for a week.
pub const REFUND_LOCK_BLOCKS: u32 = 144;

/// Size of the buyer's collateral bond, in steps. The buyer is never
/// owed more than one in-flight step, so a two-step bond covers it with
/// margin.
pub const BUYER_BOND_STEPS: u32 = 2;

/// How often an exchange retransmits its outstanding message while
/// waiting for the counterpart. The overlay is lossy by contract; step
/// messages are idempotent, so blind retransmission is safe.
pub const TRADE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// How often the submission supervisor re-publishes a live order-book
/// entry. The broker treats missing refreshes as implicit withdrawal, so
/// this doubles as the liveness heartbeat of an order.
pub const RESUBMIT_INTERVAL: Duration = Duration::from_secs(30);

/// Base delay of the relay client's reconnect backoff.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling of the relay client's reconnect backoff. The backoff is
/// bounded: a peer that lost the broker for an hour still retries every
/// half minute, not every half day.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of micro-payment steps per exchange.
pub const DEFAULT_STEP_COUNT: u32 = 10;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Configuration rejected at startup. Always fatal — a node with a bad
/// config does not limp along, it exits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `exchange.step_count` must be at least 1.
    #[error("exchange.step_count must be >= 1, got {0}")]
    InvalidStepCount(u32),

    /// A timeout option was zero.
    #[error("{option} must be a positive duration")]
    ZeroTimeout {
        /// The offending option path.
        option: &'static str,
    },

    /// `wallet.network` was not one of `main`, `test`, `regtest`.
    #[error("unknown wallet network: {0}")]
    UnknownNetwork(String),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bitcoin network the wallet operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Mainnet. Mistakes here cost real money.
    Main,
    /// Public testnet.
    Test,
    /// Local regtest, for development and the integration tests.
    Regtest,
}

impl Network {
    /// Parses the `wallet.network` option value.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "main" => Ok(Self::Main),
            "test" => Ok(Self::Test),
            "regtest" => Ok(Self::Regtest),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Relay socket options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address the broker's relay server binds.
    pub bind_address: String,
    /// Port the broker's relay server binds. Zero picks an ephemeral
    /// port, which the tests rely on.
    pub bind_port: u16,
    /// Address a peer's relay client connects to.
    pub connect_address: String,
    /// Port a peer's relay client connects to.
    pub connect_port: u16,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: DEFAULT_RELAY_PORT,
            connect_address: "127.0.0.1".to_string(),
            connect_port: DEFAULT_RELAY_PORT,
        }
    }
}

impl RelaySettings {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    /// `host:port` string for connecting.
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.connect_address, self.connect_port)
    }
}

/// Exchange protocol options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Number of micro-payment steps an exchange is divided into. Higher
    /// values bound counterparty risk tighter at the cost of more
    /// on-chain traffic.
    pub step_count: u32,
    /// Seconds to wait for a counterpart message during the handshake.
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for the counterpart's move within one step.
    pub step_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            step_count: DEFAULT_STEP_COUNT,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            step_timeout_secs: DEFAULT_STEP_TIMEOUT.as_secs(),
        }
    }
}

impl ExchangeSettings {
    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Step timeout as a [`Duration`].
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Wallet options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    /// Bitcoin network the wallet operates on.
    pub network: Network,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
        }
    }
}

/// The full runtime configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Relay socket options.
    pub relay: RelaySettings,
    /// Exchange protocol options.
    pub exchange: ExchangeSettings,
    /// Wallet options.
    pub wallet: WalletSettings,
}

impl Settings {
    /// Validates the tree. Called once at startup; any error is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange.step_count == 0 {
            return Err(ConfigError::InvalidStepCount(0));
        }
        if self.exchange.handshake_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                option: "exchange.handshake_timeout",
            });
        }
        if self.exchange.step_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                option: "exchange.step_timeout",
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// ============================================================================
// CmdBus Library
// ============================================================================

pub mod client;
pub mod config;
pub mod core;
pub mod ledger;
pub mod relay;
pub mod transport;
pub mod web;

// Re-export main types for convenience
pub use client::{BusClient, CommandHandler, FeedbackSender, FnHandler, HandlerResult, WaitFor};
pub use config::{BusConfig, RelayConfig};
pub use core::{BusError, Envelope, ReplyType, Result, StopToken};
pub use ledger::{CommandLedger, CommandStatus, LedgerEntry};
pub use relay::{RelayHandle, RelayServer, RelayedMessage};
pub use transport::MemoryBus;

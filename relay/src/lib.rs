//! # webrelay
//!
//! Offline message relay between a P2P pub/sub network and WebSocket clients.
//!
//! This crate implements a relay server that:
//! - Subscribes to network topics on behalf of WebSocket clients
//! - Persists every payload it receives so offline clients can catch up
//! - Replays unread messages on login, then streams live ones
//! - Hands client messages to network peers
//! - Never interprets payloads (they are opaque ciphertext)
//!
//! ## Architecture
//!
//! ```text
//!  P2P network                              WebSocket clients
//!      │                                          ▲
//!      │ topic stream       ┌──────────────┐      │
//!      └──────────────────► │ fan-out loop │ ─────┤ live frames
//!                           └──────┬───────┘      │
//!                                  │ put          │ replay
//!                           ┌──────▼───────┐      │
//!                           │ MessageStore │ ─────┘
//!                           └──────────────┘
//! ```
//!
//! ## Protocol
//!
//! Clients connect to `/` and authenticate with their first frame:
//! - `{userID, subscriptionKey}` → `{"auth": true}`, replay, then live messages
//! - `{peerID, pubkey}` → `{"challenge": ...}` → `{nonce}` → `{"auth": true}`
//!   (identity mode)
//!
//! While serving, clients send `EncryptedMessage` frames to reach a peer and
//! `AckMessage` frames to mark messages read.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
mod fanout;
pub mod http;
pub mod identity;
pub mod limits;
pub mod network;
pub mod registry;
pub mod report;
pub mod server;
pub mod session;
pub mod storage;

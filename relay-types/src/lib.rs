//! # webrelay-types
//!
//! Wire format types for the webrelay offline message relay.
//!
//! This crate provides the types shared by the relay and its clients:
//! - [`SubscriptionKey`], [`PeerId`], [`MessageId`] - Identifier types with canonical text forms
//! - [`TypedMessage`] - The `{"Type", "Data"}` envelope around client frames
//! - [`InboundMessage`] - Client frames accepted while a connection is serving
//! - [`ServerFrame`] - Every frame the relay writes to a client
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;

pub use error::TypesError;
pub use ids::{MessageId, PeerId, SubscriptionKey, TOPIC_PREFIX};
pub use messages::{
    decode_data, envelope_data, split_envelope, AckMessage, ChallengeResponse, EncryptedMessage,
    IdentityAuthRequest, InboundMessage, ServerFrame, SubscribeRequest, TypedMessage,
};

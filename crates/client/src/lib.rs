//! Signaling and connection-lifecycle core of a two-party video call.
//!
//! [`call::CallClient`] owns one session at a time and drives a single
//! peer connection through negotiation, failure and rebuild. Everything it
//! talks to sits behind a trait: the relay ([`transport`]), the connection
//! ([`peer`]), media capture ([`media`]), ICE servers, the metrics
//! endpoint and the token provider. The [`ws`] and [`rtc`] modules hold
//! the production adapters.

pub mod call;
pub mod config;
pub mod dispatcher;
pub mod error;
mod handle;
pub mod ice_buffer;
pub mod ice_servers;
pub mod media;
pub mod metrics;
pub mod monitor;
pub mod negotiation;
pub mod network;
pub mod peer;
pub mod reconnect;
pub mod rtc;
pub mod token;
pub mod transport;
pub mod ws;

#[cfg(test)]
mod testing;

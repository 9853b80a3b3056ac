//! MMU request/response protocol
//!
//! Driving the external multi-material unit splits into three layers:
//!
//! - [`protocol`]: message types and the CRC8 text codec
//! - [`transport`]: the [`transport::MmuLink`] abstraction with serial and
//!   register-bus implementations
//! - [`logic`]: the [`logic::ProtocolLogic`] state machine stepping the
//!   handshake, heartbeat and command exchanges

pub mod logic;
pub mod protocol;
pub mod transport;

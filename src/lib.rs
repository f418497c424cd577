//! Peer-to-peer chat node where every chat message moves a balance.
//!
//! Each node keeps an append-only [`ledger::Ledger`]: messages it sends are
//! debited, messages it receives are credited. Inbound chat reaches the
//! ledger through [`chat::ChatPlugin`], outbound chat through
//! [`session::Session`].

pub mod chat;
pub mod config;
pub mod ledger;
pub mod network;
pub mod session;

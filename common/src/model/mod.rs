//! Domain models for the exchange core

pub mod order;
pub mod trade;
pub mod account;
pub mod variety;

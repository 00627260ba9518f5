//! Types library for the venue feed client
//!
//! Shared type definitions used by the streaming client and the tick record
//! store, so both sides agree on bar, proposal and error shapes.
//!
//! # Modules
//! - `ids`: Identifiers (RequestId, Symbol)
//! - `market`: Bars, payout proposals, live price updates, candle series
//! - `errors`: Caller-visible error codes and venue error classification

// Public modules
pub mod ids;
pub mod market;
pub mod errors;

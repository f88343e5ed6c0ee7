#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod bot;
pub mod bridge;
pub mod chain;
pub mod command;
pub mod config;
pub mod database;
pub mod fs;
pub mod history;
pub mod htlc;
pub mod secret;
pub mod seed;
pub mod timestamp;
pub mod trace;
pub mod trade;
pub mod wallet;

#[cfg(test)]
pub mod test_harness;

#[cfg(test)]
mod arbitrary;

pub use seed::Seed;
pub use trade::TradeId;

#[cfg(test)]
pub use test_harness::StaticStub;

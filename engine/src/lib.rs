//! Core orchestration engine for Mark, an operator that settles
//! cross-chain invoices on the Everclear network.
//!
//! Invoice and settlement events arrive over a webhook, are deduplicated
//! and scheduled by the event queue, and driven by the event processor:
//! validate, reconcile the invoice's earmark, rebalance inventory across
//! chains when the designated destination is short, then purchase through
//! the hub. Independent tickers complete in-flight rebalance operations on
//! their destination side and expire the stuck ones.

pub mod bridge;
pub mod cache;
pub mod chain;
pub mod constants;
pub mod db;
pub mod event;
pub mod hub;
pub mod metrics;
pub mod rebalance;
pub mod settings;
pub mod utils;
pub mod webhook;

//! Crypto payment settlement and loyalty-token ledger for a restaurant
//! commerce platform.
//!
//! The service settles customer orders paid in Stellar assets (XLM, USDC)
//! and runs the restaurant's loyalty-token economy on top of the same
//! ledger: confirmed payments earn tokens at the token's per-dollar rate,
//! redemptions return tokens to supply, and every balance mutation leaves an
//! audit row.
//!
//! # Modules
//!
//! - [`app`] — Application wiring shared by the HTTP layer and jobs.
//! - [`config`] — CLI/env configuration.
//! - [`directory`] — Seams to the ordering subsystem and wallet authentication.
//! - [`handlers`] — HTTP endpoints for payments, wallets, loyalty, and rates.
//! - [`jobs`] — Background reconciliation loops.
//! - [`ledger`] — The concurrent store owning all persistent state and its
//!   conditional transition primitives.
//! - [`loyalty`] — Token creation, issuance, redemption, and holder reporting.
//! - [`orchestrator`] — The payment lifecycle state machine.
//! - [`rates`] — Exchange-rate feed abstraction with TTL caching.
//! - [`timestamp`] — Unix timestamp type for payment windows and audit rows.
//! - [`types`] — Domain entities, id newtypes, and enums.
//! - [`verifier`] — Chain verification seam with a simulated Horizon backend.

pub mod app;
pub mod config;
pub mod directory;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod loyalty;
pub mod orchestrator;
pub mod rates;
pub mod timestamp;
pub mod types;
pub mod verifier;

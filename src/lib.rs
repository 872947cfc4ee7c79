//! Mobile-money payment confirmation for the Kahawa storefront
//!
//! Coordinates M-Pesa and Airtel Money pushes from initiation to a terminal
//! outcome and marks the order paid exactly once.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod payments;

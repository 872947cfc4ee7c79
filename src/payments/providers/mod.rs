//! Payment gateway implementations
//!
//! Concrete implementations of the PaymentGateway trait for different providers.

pub mod airtel;
pub mod client;
pub mod mpesa;
pub mod phone;

pub use airtel::{AirtelConfig, AirtelGateway};
pub use mpesa::{MpesaConfig, MpesaGateway};

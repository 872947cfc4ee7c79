//! Mobile-money payment confirmation
//!
//! This module drives M-Pesa and Airtel Money payments from the push prompt to a
//! terminal outcome and marks the order paid when the customer confirms.

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod providers;
pub mod sweeper;
pub mod traits;
pub mod types;

pub use coordinator::{CoordinatorConfig, PaymentConfirmationCoordinator};
pub use error::{GatewayError, PaymentError, PaymentResult};
pub use sweeper::{SweeperConfig, TimeoutSweeper};
pub use types::{AttemptState, GatewayStatus, PaymentAttempt, Provider};

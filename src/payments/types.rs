//! Payment attempt types and data structures
//!
//! Common types shared by the coordinator, the gateway clients and the stores.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Mobile-money provider a customer pays through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Mpesa,
    AirtelMoney,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mpesa => "mpesa",
            Provider::AirtelMoney => "airtel_money",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mpesa" | "m-pesa" => Ok(Provider::Mpesa),
            "airtel_money" | "airtel" => Ok(Provider::AirtelMoney),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Lifecycle state of a payment attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Attempt recorded, push not yet acknowledged by the gateway
    Initiated,
    /// Push accepted, waiting for the customer to confirm on the handset
    AwaitingConfirmation,
    /// Gateway reported success
    Completed,
    /// Gateway rejected the push or the customer declined
    Failed,
    /// Confirmation window elapsed without a gateway answer
    TimedOut,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::Failed | AttemptState::TimedOut
        )
    }

    /// States reachable in one step from this state
    pub fn valid_transitions(&self) -> &'static [AttemptState] {
        match self {
            AttemptState::Initiated => &[
                AttemptState::AwaitingConfirmation,
                AttemptState::Failed,
                AttemptState::TimedOut,
            ],
            AttemptState::AwaitingConfirmation => &[
                AttemptState::Completed,
                AttemptState::Failed,
                AttemptState::TimedOut,
            ],
            AttemptState::Completed | AttemptState::Failed | AttemptState::TimedOut => &[],
        }
    }

    pub fn can_transition_to(&self, target: AttemptState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Initiated => "initiated",
            AttemptState::AwaitingConfirmation => "awaiting_confirmation",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
            AttemptState::TimedOut => "timed_out",
        }
    }

    /// Convert from the database column value
    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "initiated" => Some(AttemptState::Initiated),
            "awaiting_confirmation" => Some(AttemptState::AwaitingConfirmation),
            "completed" => Some(AttemptState::Completed),
            "failed" => Some(AttemptState::Failed),
            "timed_out" => Some(AttemptState::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One customer-initiated mobile-money payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub order_id: String,
    pub provider: Provider,
    pub phone_number: String,
    pub amount: Decimal,
    pub state: AttemptState,
    /// Gateway correlation id, set once the push is accepted
    pub provider_reference: Option<String>,
    /// Receipt number reported by the gateway on success
    pub provider_receipt: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the order store acknowledged `mark_paid` for this attempt
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    pub fn new(
        order_id: impl Into<String>,
        provider: Provider,
        phone_number: impl Into<String>,
        amount: Decimal,
        created_at: DateTime<Utc>,
        confirmation_window: chrono::Duration,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            order_id: order_id.into(),
            provider,
            phone_number: phone_number.into(),
            amount,
            state: AttemptState::Initiated,
            provider_reference: None,
            provider_receipt: None,
            failure_reason: None,
            created_at,
            expires_at: created_at + confirmation_window,
            last_checked_at: None,
            resolved_at: None,
            settled_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Completed attempts whose order has not been marked paid yet
    pub fn needs_settlement(&self) -> bool {
        self.state == AttemptState::Completed && self.settled_at.is_none()
    }

    /// Terminal and settled: the record can no longer change
    pub fn is_final(&self) -> bool {
        self.state.is_terminal() && !self.needs_settlement()
    }
}

/// A guarded state change applied through the attempt store
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AttemptState,
    pub to: AttemptState,
    pub at: DateTime<Utc>,
    pub provider_reference: Option<String>,
    pub provider_receipt: Option<String>,
    pub failure_reason: Option<String>,
}

impl Transition {
    pub fn new(from: AttemptState, to: AttemptState, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            provider_reference: None,
            provider_receipt: None,
            failure_reason: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.provider_reference = Some(reference.into());
        self
    }

    pub fn with_receipt(mut self, receipt: Option<String>) -> Self {
        self.provider_receipt = receipt;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.failure_reason = reason;
        self
    }

    /// Apply to an in-memory record; the caller has already checked `from`
    pub fn apply(&self, attempt: &mut PaymentAttempt) {
        attempt.state = self.to;
        if let Some(reference) = &self.provider_reference {
            attempt.provider_reference = Some(reference.clone());
        }
        if self.provider_receipt.is_some() {
            attempt.provider_receipt = self.provider_receipt.clone();
        }
        if self.failure_reason.is_some() {
            attempt.failure_reason = self.failure_reason.clone();
        }
        if self.to.is_terminal() {
            attempt.resolved_at = Some(self.at);
        }
    }
}

/// Push request sent to a gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub phone_number: String,
    pub amount: Decimal,
    /// Reference shown to the customer and echoed by the gateway
    pub order_ref: String,
    /// Attempt id, forwarded where the gateway accepts a merchant reference
    pub attempt_id: Uuid,
}

/// Status of a push as reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GatewayStatus {
    Success { receipt: Option<String> },
    Failure { reason: Option<String> },
    Pending,
}

/// What a provider callback claims about a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotice {
    pub provider_reference: String,
    pub reported: GatewayStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_state_transitions_valid() {
        assert!(AttemptState::Initiated.can_transition_to(AttemptState::AwaitingConfirmation));
        assert!(AttemptState::Initiated.can_transition_to(AttemptState::Failed));
        assert!(AttemptState::AwaitingConfirmation.can_transition_to(AttemptState::Completed));
        assert!(AttemptState::AwaitingConfirmation.can_transition_to(AttemptState::TimedOut));
    }

    #[test]
    fn test_state_transitions_invalid() {
        assert!(!AttemptState::Initiated.can_transition_to(AttemptState::Completed));
        assert!(!AttemptState::AwaitingConfirmation.can_transition_to(AttemptState::Initiated));
        for terminal in [
            AttemptState::Completed,
            AttemptState::Failed,
            AttemptState::TimedOut,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_state_db_status_round_trip() {
        assert_eq!(
            AttemptState::from_db_status("awaiting_confirmation"),
            Some(AttemptState::AwaitingConfirmation)
        );
        assert_eq!(AttemptState::TimedOut.as_str(), "timed_out");
        assert_eq!(AttemptState::from_db_status("paid"), None);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("mpesa".parse::<Provider>(), Ok(Provider::Mpesa));
        assert_eq!("Airtel".parse::<Provider>(), Ok(Provider::AirtelMoney));
        assert!("paypal".parse::<Provider>().is_err());
        assert_eq!(
            serde_json::to_string(&Provider::AirtelMoney).unwrap(),
            "\"airtel_money\""
        );
    }

    #[test]
    fn test_new_attempt_deadline() {
        let now = Utc::now();
        let attempt = PaymentAttempt::new(
            "O1",
            Provider::Mpesa,
            "+254712345678",
            dec!(1500),
            now,
            chrono::Duration::seconds(120),
        );
        assert_eq!(attempt.state, AttemptState::Initiated);
        assert!(!attempt.is_expired_at(now + chrono::Duration::seconds(119)));
        assert!(attempt.is_expired_at(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_transition_apply_sets_resolution() {
        let now = Utc::now();
        let mut attempt = PaymentAttempt::new(
            "O1",
            Provider::Mpesa,
            "0712345678",
            dec!(10),
            now,
            chrono::Duration::seconds(120),
        );
        Transition::new(AttemptState::Initiated, AttemptState::AwaitingConfirmation, now)
            .with_reference("ws_CO_1")
            .apply(&mut attempt);
        assert_eq!(attempt.provider_reference.as_deref(), Some("ws_CO_1"));
        assert!(attempt.resolved_at.is_none());

        Transition::new(AttemptState::AwaitingConfirmation, AttemptState::Completed, now)
            .with_receipt(Some("NLJ7RT61SV".to_string()))
            .apply(&mut attempt);
        assert_eq!(attempt.resolved_at, Some(now));
        assert!(attempt.needs_settlement());
        assert!(!attempt.is_final());
    }
}

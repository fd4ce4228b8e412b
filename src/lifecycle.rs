//! Transaction lifecycle: order identity and the state machine.
//!
//! State transitions are driven only by verified provider responses or
//! verified callbacks. A [`CallbackNotification`] can only be produced by a
//! signature-checked decode path, so accepting one here preserves the
//! invariant that forged confirmations never move an order.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{CallbackNotification, CallbackOutcome, ProviderTag};

const SUFFIX_WIDTH: u32 = 4;

/// Generates an order identity: nanosecond-precision timestamp plus a
/// fixed-width random numeric suffix. Collision requires the time prefix
/// and the suffix to coincide; the id is a correlation/idempotency key,
/// not a security token.
pub fn generate_order_id() -> String {
    let prefix = Utc::now().format("%Y%m%d%H%M%S%f");
    let suffix: u32 = rand::thread_rng().gen_range(0..10u32.pow(SUFFIX_WIDTH));
    format!("{}{:04}", prefix, suffix)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Created,
    Submitted,
    Paid,
    Failed,
    Expired,
    Refunding,
    Refunded,
    Closed,
}

impl OrderState {
    /// Terminal for its branch: no verified input moves the order further,
    /// except `Paid`, which may still enter the refund branch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Paid | OrderState::Failed | OrderState::Refunded | OrderState::Closed
        )
    }
}

/// Result of applying a verified input to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transitioned(OrderState),
    /// The order was already in the target state; the input was a
    /// duplicate delivery and nothing changed.
    AlreadyFinal,
}

/// A payment order. Owned by the caller; the gateway only drives state
/// transitions and never persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub provider: ProviderTag,
    pub amount: Decimal,
    pub subject: String,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub timeout_minutes: Option<u32>,
}

impl Order {
    pub fn new(
        provider: ProviderTag,
        amount: Decimal,
        subject: impl Into<String>,
        timeout_minutes: Option<u32>,
    ) -> Self {
        Self {
            order_id: generate_order_id(),
            provider,
            amount,
            subject: subject.into(),
            state: OrderState::Created,
            created_at: Utc::now(),
            timeout_minutes,
        }
    }

    /// Marks the charge as dispatched: the network accepted the request,
    /// which is not yet a business confirmation.
    pub fn mark_submitted(&mut self) -> GatewayResult<()> {
        if self.state != OrderState::Created {
            return Err(self.invalid_transition("submit"));
        }
        self.state = OrderState::Submitted;
        Ok(())
    }

    /// Applies a verified callback. Duplicate deliveries for an order
    /// already in the target terminal state are ignored, so receiving the
    /// same callback twice applies exactly one transition.
    pub fn apply_callback(
        &mut self,
        notification: &CallbackNotification,
    ) -> GatewayResult<Applied> {
        if notification.order_id != self.order_id {
            return Err(GatewayError::Validation {
                message: "callback order id does not match this order".to_string(),
                field: Some("order_id".to_string()),
            });
        }
        if notification.provider != self.provider {
            return Err(GatewayError::Validation {
                message: "callback provider does not match this order".to_string(),
                field: Some("provider".to_string()),
            });
        }

        let target = match notification.outcome {
            CallbackOutcome::Paid => OrderState::Paid,
            CallbackOutcome::Failed => OrderState::Failed,
            CallbackOutcome::Closed => OrderState::Closed,
            // A pending outcome carries no transition.
            CallbackOutcome::Pending => return Ok(Applied::AlreadyFinal),
        };

        if self.state == target {
            info!(order_id = %self.order_id, state = ?target, "duplicate callback ignored");
            return Ok(Applied::AlreadyFinal);
        }

        let allowed = matches!(
            (self.state, target),
            (OrderState::Submitted, OrderState::Paid)
                | (OrderState::Submitted, OrderState::Failed)
                | (OrderState::Created, OrderState::Closed)
                | (OrderState::Submitted, OrderState::Closed)
                | (OrderState::Failed, OrderState::Closed)
                | (OrderState::Expired, OrderState::Closed)
                | (OrderState::Refunding, OrderState::Refunded)
        );
        if !allowed {
            warn!(
                order_id = %self.order_id,
                from = ?self.state,
                to = ?target,
                "callback transition refused"
            );
            return Err(self.invalid_transition("callback"));
        }

        self.state = target;
        info!(order_id = %self.order_id, state = ?target, "order transitioned");
        Ok(Applied::Transitioned(target))
    }

    /// Enters the refund branch after a verified refund acceptance.
    pub fn begin_refund(&mut self) -> GatewayResult<()> {
        if self.state != OrderState::Paid {
            return Err(self.invalid_transition("refund"));
        }
        self.state = OrderState::Refunding;
        Ok(())
    }

    /// Completes the refund branch after a verified refund confirmation.
    pub fn mark_refunded(&mut self) -> GatewayResult<Applied> {
        match self.state {
            OrderState::Refunded => Ok(Applied::AlreadyFinal),
            OrderState::Refunding => {
                self.state = OrderState::Refunded;
                Ok(Applied::Transitioned(OrderState::Refunded))
            }
            _ => Err(self.invalid_transition("refund confirmation")),
        }
    }

    /// Closes an unpaid order after a verified close response.
    pub fn mark_closed(&mut self) -> GatewayResult<Applied> {
        match self.state {
            OrderState::Closed => Ok(Applied::AlreadyFinal),
            OrderState::Created
            | OrderState::Submitted
            | OrderState::Failed
            | OrderState::Expired => {
                self.state = OrderState::Closed;
                Ok(Applied::Transitioned(OrderState::Closed))
            }
            _ => Err(self.invalid_transition("close")),
        }
    }

    /// Expires a submitted order once the provider-declared timeout has
    /// elapsed without confirmation. Returns the state after the check.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> OrderState {
        if self.state == OrderState::Submitted {
            if let Some(minutes) = self.timeout_minutes {
                if now - self.created_at > Duration::minutes(i64::from(minutes)) {
                    self.state = OrderState::Expired;
                    info!(order_id = %self.order_id, "order expired without confirmation");
                }
            }
        }
        self.state
    }

    fn invalid_transition(&self, action: &str) -> GatewayError {
        GatewayError::Validation {
            message: format!(
                "cannot apply {} while order is {:?}",
                action, self.state
            ),
            field: Some("state".to_string()),
        }
    }
}

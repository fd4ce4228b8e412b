use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTag {
    Alipay,
    Wechat,
}

impl ProviderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Alipay => "alipay",
            ProviderTag::Wechat => "wechat",
        }
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderTag {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "alipay" => Ok(ProviderTag::Alipay),
            "wechat" | "wechatpay" | "weixin" => Ok(ProviderTag::Wechat),
            _ => Err(GatewayError::Validation {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Converts a fixed-point yuan amount to integer minor units (fen).
///
/// The shared-secret network only accepts integer fen; an amount with
/// sub-fen precision is a caller contract violation, not a rounding case.
pub fn to_minor_units(amount: Decimal) -> GatewayResult<i64> {
    let fen = amount * Decimal::from(100);
    if fen.fract() != Decimal::ZERO {
        return Err(GatewayError::Validation {
            message: format!("amount {} has sub-fen precision", amount),
            field: Some("amount".to_string()),
        });
    }
    fen.to_i64().ok_or(GatewayError::Validation {
        message: "amount out of range for minor units".to_string(),
        field: Some("amount".to_string()),
    })
}

/// Provider-neutral charge request. Immutable once constructed; adapters
/// apply their own per-provider limits (content truncation, fen conversion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub order_id: String,
    /// Fixed-point yuan amount; never a float on the wire.
    pub amount: Decimal,
    pub subject: String,
    /// Free-form description, truncated to the provider limit.
    pub content: String,
    /// Opaque passthrough returned untouched in the callback.
    pub passback: Option<String>,
    pub callback_url: String,
    /// Expiry in minutes; must be positive when present.
    pub timeout_minutes: Option<u32>,
    /// Client IP, required by the shared-secret network.
    pub client_ip: Option<String>,
}

impl ChargeRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.order_id.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "order_id is required".to_string(),
                field: Some("order_id".to_string()),
            });
        }
        if self.amount <= Decimal::ZERO {
            return Err(GatewayError::Validation {
                message: "amount must be greater than zero".to_string(),
                field: Some("amount".to_string()),
            });
        }
        if let Some(0) = self.timeout_minutes {
            return Err(GatewayError::Validation {
                message: "timeout must be a positive number of minutes".to_string(),
                field: Some("timeout_minutes".to_string()),
            });
        }
        Ok(())
    }
}

/// Signed request body the client application presents to the provider to
/// finish authorization. Opaque to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandoffPayload {
    /// Percent-encoded signed order string (asymmetric-signature network).
    OrderString(String),
    /// Signed field set from the unified-order response (shared-secret
    /// network), carrying the prepay handle.
    Fields(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub provider: ProviderTag,
    pub order_id: String,
    pub handoff: HandoffPayload,
}

/// Lookup criteria for query/close; at least one identifier is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeCriteria {
    /// Our order id (`out_trade_no`).
    pub order_id: Option<String>,
    /// The provider's transaction id (`trade_no` / `transaction_id`).
    pub provider_txn_id: Option<String>,
}

impl TradeCriteria {
    pub fn for_order(order_id: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            provider_txn_id: None,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.order_id.as_deref().map_or(true, str::is_empty)
            && self.provider_txn_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(GatewayError::Validation {
                message: "order_id or provider_txn_id is required".to_string(),
                field: Some("criteria".to_string()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub order_id: Option<String>,
    pub provider_txn_id: Option<String>,
    /// Merchant-side refund id; the provider deduplicates retries on it.
    pub refund_id: String,
    /// Refund amount in yuan.
    pub amount: Decimal,
    /// Original order total in yuan (required by the shared-secret network).
    pub total: Decimal,
    pub reason: Option<String>,
}

impl RefundRequest {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.order_id.as_deref().map_or(true, str::is_empty)
            && self.provider_txn_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(GatewayError::Validation {
                message: "order_id or provider_txn_id is required".to_string(),
                field: Some("refund".to_string()),
            });
        }
        if self.refund_id.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "refund_id is required".to_string(),
                field: Some("refund_id".to_string()),
            });
        }
        if self.amount <= Decimal::ZERO || self.amount > self.total {
            return Err(GatewayError::Validation {
                message: "refund amount must be positive and within the order total"
                    .to_string(),
                field: Some("amount".to_string()),
            });
        }
        Ok(())
    }
}

/// Raw provider response, surfaced for the caller to decode. Business-level
/// success codes are not interpreted beyond envelope and signature validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider: ProviderTag,
    /// Response body exactly as received.
    pub raw: String,
    /// Flat key/value view of the response fields.
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Paid,
    Failed,
    Closed,
    Pending,
}

/// A provider callback whose signature has been verified. Only the
/// signature-checked decode paths construct this type, so holding one is
/// proof the fields can be trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackNotification {
    pub provider: ProviderTag,
    pub order_id: String,
    pub provider_txn_id: Option<String>,
    pub amount: Option<Decimal>,
    pub outcome: CallbackOutcome,
    /// Full verified field set for caller-side bookkeeping.
    pub fields: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_tag_parsing_works() {
        assert_eq!(ProviderTag::from_str("alipay").unwrap(), ProviderTag::Alipay);
        assert_eq!(ProviderTag::from_str("WeChat").unwrap(), ProviderTag::Wechat);
        assert!(ProviderTag::from_str("paypal").is_err());
    }

    #[test]
    fn minor_unit_conversion_requires_integer_fen() {
        assert_eq!(to_minor_units(Decimal::new(999, 2)).unwrap(), 999);
        assert_eq!(to_minor_units(Decimal::new(1, 0)).unwrap(), 100);
        assert!(matches!(
            to_minor_units(Decimal::new(9999, 3)),
            Err(GatewayError::Validation { .. })
        ));
    }

    #[test]
    fn charge_request_validation_rejects_bad_input() {
        let mut request = ChargeRequest {
            order_id: "20240101000000123456".to_string(),
            amount: Decimal::new(999, 2),
            subject: "widget".to_string(),
            content: "a widget".to_string(),
            passback: None,
            callback_url: "https://example.com/cb".to_string(),
            timeout_minutes: Some(90),
            client_ip: None,
        };
        assert!(request.validate().is_ok());

        request.amount = Decimal::ZERO;
        assert!(request.validate().is_err());

        request.amount = Decimal::new(999, 2);
        request.timeout_minutes = Some(0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn refund_request_validation_bounds_amount() {
        let request = RefundRequest {
            order_id: Some("o1".to_string()),
            provider_txn_id: None,
            refund_id: "r1".to_string(),
            amount: Decimal::new(500, 2),
            total: Decimal::new(400, 2),
            reason: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn trade_criteria_requires_an_identifier() {
        assert!(TradeCriteria::default().validate().is_err());
        assert!(TradeCriteria::for_order("o1").validate().is_ok());
    }
}

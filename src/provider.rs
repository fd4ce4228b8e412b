use async_trait::async_trait;

use crate::error::GatewayResult;
use crate::types::{
    CallbackNotification, ChargeRequest, ChargeResponse, ProviderResponse, ProviderTag,
    RefundRequest, TradeCriteria,
};

/// Uniform capability set every payment network implements.
///
/// Callers select an implementation by [`ProviderTag`] at the call site and
/// never need to know which network is behind it. Implementations hold only
/// immutable credentials and a cloneable HTTP client, so any number of
/// operations may run concurrently without locks.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Builds, signs and (where the network requires it) submits a charge,
    /// returning the handoff payload the client app presents to finish
    /// authorization.
    async fn create_charge(&self, request: ChargeRequest) -> GatewayResult<ChargeResponse>;

    /// Looks up the current provider-side state of a trade.
    async fn query(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse>;

    /// Requests a refund against a paid trade. Retries are safe only when
    /// the caller reuses the same `refund_id`.
    async fn refund(&self, request: RefundRequest) -> GatewayResult<ProviderResponse>;

    /// Closes an unpaid trade.
    async fn close(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse>;

    /// Authenticates and decodes an inbound callback payload. This is the
    /// only inbound surface: no field is trusted before the signature
    /// verifies, and a mismatch is an error, never a decoded value.
    fn verify_and_decode(&self, raw_payload: &[u8]) -> GatewayResult<CallbackNotification>;

    fn tag(&self) -> ProviderTag;
}

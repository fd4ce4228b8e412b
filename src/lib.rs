//! Multi-provider payment transaction gateway.
//!
//! Constructs, signs, transmits and interprets payment operations (charge,
//! query, refund, close) against two structurally different networks — an
//! asymmetric-signature one (Alipay) and a shared-secret one (WeChat Pay) —
//! behind the uniform [`provider::ProviderGateway`] contract. Inbound
//! callbacks enter through [`factory::GatewayFactory::verify_and_decode`];
//! no callback field is trusted before its signature verifies.
//!
//! The crate owns no persistence and runs no HTTP server; order lifecycle
//! state is reported back to the caller through [`lifecycle::Order`].

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod provider;
pub mod providers;
pub mod signing;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{AlipayCredentials, GatewayConfig, WechatCredentials};
pub use error::{GatewayError, GatewayResult};
pub use factory::GatewayFactory;
pub use lifecycle::{generate_order_id, Applied, Order, OrderState};
pub use provider::ProviderGateway;
pub use providers::{AlipayProvider, WechatProvider};
pub use types::{
    CallbackNotification, CallbackOutcome, ChargeRequest, ChargeResponse, HandoffPayload,
    ProviderResponse, ProviderTag, RefundRequest, TradeCriteria,
};

//! Shared-secret network adapter (WeChat Pay merchant API).
//!
//! Requests carry a keyed-digest signature (MD5 or HMAC-SHA256 over the
//! canonical form with a trailing `&key=` secret, uppercased hex) and
//! travel as XML bodies. Refunds additionally require mutual TLS with the
//! merchant client certificate, which is distinct from the signing secret.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::config::WechatCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::provider::ProviderGateway;
use crate::signing::{generate_nonce, keyed_sign, secure_eq, strip_empty};
use crate::transport::GatewayHttpClient;
use crate::types::{
    to_minor_units, CallbackNotification, CallbackOutcome, ChargeRequest, ChargeResponse,
    HandoffPayload, ProviderResponse, ProviderTag, RefundRequest, TradeCriteria,
};
use crate::wire;

const UNIFIED_ORDER_PATH: &str = "/pay/unifiedorder";
const ORDER_QUERY_PATH: &str = "/pay/orderquery";
const CLOSE_ORDER_PATH: &str = "/pay/closeorder";
const REFUND_PATH: &str = "/secapi/pay/refund";

const BODY_LIMIT: usize = 128;
const SUCCESS: &str = "SUCCESS";

pub struct WechatProvider {
    credentials: WechatCredentials,
    http: GatewayHttpClient,
    /// Mutual-TLS client, present only when a client certificate bundle is
    /// configured. Refunds refuse to run without it.
    refund_http: Option<GatewayHttpClient>,
}

impl WechatProvider {
    pub fn new(credentials: WechatCredentials) -> GatewayResult<Self> {
        credentials.validate()?;
        let timeout = Duration::from_secs(credentials.timeout_secs);
        let http = GatewayHttpClient::new(timeout)?;
        let refund_http = match &credentials.client_identity_pem {
            Some(pem) => Some(GatewayHttpClient::with_client_identity(timeout, pem)?),
            None => None,
        };
        Ok(Self {
            credentials,
            http,
            refund_http,
        })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(WechatCredentials::from_env()?)
    }

    /// Mandatory field set with a fresh per-request nonce; signature and
    /// amount fields are left for the caller to fill.
    pub fn base_params(&self, client_ip: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.credentials.app_id.clone());
        params.insert("mch_id".to_string(), self.credentials.merchant_id.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        params.insert("spbill_create_ip".to_string(), client_ip.to_string());
        params.insert(
            "notify_url".to_string(),
            self.credentials.callback_url.clone(),
        );
        params.insert("trade_type".to_string(), "APP".to_string());
        params
    }

    /// Keyed-digest signature over the non-empty parameters.
    pub fn generate_sign(&self, params: &BTreeMap<String, String>) -> String {
        keyed_sign(
            &strip_empty(params),
            &self.credentials.api_key,
            self.credentials.sign_type,
        )
    }

    fn sign_params(&self, mut params: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let signature = self.generate_sign(&params);
        params.insert("sign".to_string(), signature);
        params
    }

    /// Serializes the signed parameter set to XML, posts it, and parses the
    /// XML response, enforcing the envelope and signature rules.
    pub async fn submit_charge(
        &self,
        params: BTreeMap<String, String>,
    ) -> GatewayResult<ProviderResponse> {
        self.post(&self.http, UNIFIED_ORDER_PATH, params).await
    }

    /// Submits a signed refund over mutual TLS. `total_fee` and
    /// `refund_fee` must already be integer minor units; a decimal here is
    /// a caller contract violation.
    pub async fn apply_refund(
        &self,
        params: BTreeMap<String, String>,
    ) -> GatewayResult<ProviderResponse> {
        for field in ["total_fee", "refund_fee"] {
            let value = params.get(field).map(String::as_str).unwrap_or_default();
            if value.parse::<i64>().is_err() {
                return Err(GatewayError::Validation {
                    message: format!("{} must be an integer amount in minor units", field),
                    field: Some(field.to_string()),
                });
            }
        }
        let refund_http = self
            .refund_http
            .as_ref()
            .ok_or_else(|| GatewayError::Configuration {
                message: "refund requires a configured client certificate".to_string(),
            })?;
        self.post(refund_http, REFUND_PATH, params).await
    }

    async fn post(
        &self,
        http: &GatewayHttpClient,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> GatewayResult<ProviderResponse> {
        let body = wire::to_xml(&params)?;
        let url = format!("{}{}", self.credentials.base_url, path);
        let raw = http.post_xml(&url, body).await?;
        self.decode_envelope(raw)
    }

    /// Envelope rules: a communication-level failure (`return_code`) and a
    /// business refusal (`result_code`) are both surfaced verbatim; on the
    /// success path the response signature must verify before any field is
    /// returned.
    fn decode_envelope(&self, raw: String) -> GatewayResult<ProviderResponse> {
        let fields = wire::from_xml(raw.as_bytes())?;

        if fields.get("return_code").map(String::as_str) != Some(SUCCESS) {
            return Err(GatewayError::ProviderBusiness {
                provider: ProviderTag::Wechat.to_string(),
                message: fields
                    .get("return_msg")
                    .cloned()
                    .unwrap_or_else(|| "provider rejected the request".to_string()),
                provider_code: fields.get("return_code").cloned(),
            });
        }

        self.check_signature(&fields)?;

        if fields.get("result_code").map(String::as_str) == Some("FAIL") {
            return Err(GatewayError::ProviderBusiness {
                provider: ProviderTag::Wechat.to_string(),
                message: fields
                    .get("err_code_des")
                    .cloned()
                    .unwrap_or_else(|| "provider refused the request".to_string()),
                provider_code: fields.get("err_code").cloned(),
            });
        }

        Ok(ProviderResponse {
            provider: ProviderTag::Wechat,
            raw,
            fields,
        })
    }

    fn check_signature(&self, fields: &BTreeMap<String, String>) -> GatewayResult<()> {
        let claimed = fields
            .get("sign")
            .ok_or_else(|| GatewayError::SignatureMismatch {
                message: "provider message carries no signature".to_string(),
            })?;
        let expected = self.generate_sign(fields);
        if !secure_eq(expected.as_bytes(), claimed.trim().as_bytes()) {
            return Err(GatewayError::SignatureMismatch {
                message: "keyed digest does not match provider message".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderGateway for WechatProvider {
    async fn create_charge(&self, request: ChargeRequest) -> GatewayResult<ChargeResponse> {
        request.validate()?;
        let client_ip = request
            .client_ip
            .as_deref()
            .ok_or_else(|| GatewayError::Validation {
                message: "client_ip is required for this provider".to_string(),
                field: Some("client_ip".to_string()),
            })?;

        let mut params = self.base_params(client_ip);
        params.insert(
            "body".to_string(),
            request.subject.chars().take(BODY_LIMIT).collect(),
        );
        if !request.content.is_empty() {
            params.insert("detail".to_string(), request.content.clone());
        }
        params.insert("out_trade_no".to_string(), request.order_id.clone());
        params.insert(
            "total_fee".to_string(),
            to_minor_units(request.amount)?.to_string(),
        );
        let params = self.sign_params(params);

        let response = self.submit_charge(params).await?;
        info!(order_id = %request.order_id, "wechat charge accepted");
        Ok(ChargeResponse {
            provider: ProviderTag::Wechat,
            order_id: request.order_id,
            handoff: HandoffPayload::Fields(response.fields),
        })
    }

    async fn query(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse> {
        criteria.validate()?;
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.credentials.app_id.clone());
        params.insert("mch_id".to_string(), self.credentials.merchant_id.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        if let Some(txn_id) = &criteria.provider_txn_id {
            params.insert("transaction_id".to_string(), txn_id.clone());
        } else if let Some(order_id) = &criteria.order_id {
            params.insert("out_trade_no".to_string(), order_id.clone());
        }
        let params = self.sign_params(params);
        self.post(&self.http, ORDER_QUERY_PATH, params).await
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ProviderResponse> {
        request.validate()?;
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.credentials.app_id.clone());
        params.insert("mch_id".to_string(), self.credentials.merchant_id.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        if let Some(txn_id) = &request.provider_txn_id {
            params.insert("transaction_id".to_string(), txn_id.clone());
        } else if let Some(order_id) = &request.order_id {
            params.insert("out_trade_no".to_string(), order_id.clone());
        }
        params.insert("out_refund_no".to_string(), request.refund_id.clone());
        params.insert(
            "total_fee".to_string(),
            to_minor_units(request.total)?.to_string(),
        );
        params.insert(
            "refund_fee".to_string(),
            to_minor_units(request.amount)?.to_string(),
        );
        let params = self.sign_params(params);

        info!(refund_id = %request.refund_id, "wechat refund requested");
        self.apply_refund(params).await
    }

    async fn close(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse> {
        criteria.validate()?;
        let order_id = criteria
            .order_id
            .as_ref()
            .ok_or_else(|| GatewayError::Validation {
                message: "close requires the merchant order_id".to_string(),
                field: Some("order_id".to_string()),
            })?;
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.credentials.app_id.clone());
        params.insert("mch_id".to_string(), self.credentials.merchant_id.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        params.insert("out_trade_no".to_string(), order_id.clone());
        let params = self.sign_params(params);
        self.post(&self.http, CLOSE_ORDER_PATH, params).await
    }

    fn verify_and_decode(&self, raw_payload: &[u8]) -> GatewayResult<CallbackNotification> {
        let fields = wire::from_xml(raw_payload)?;
        self.check_signature(&fields)?;

        let order_id = fields
            .get("out_trade_no")
            .cloned()
            .ok_or_else(|| GatewayError::WireDecoding {
                message: "callback is missing out_trade_no".to_string(),
            })?;
        let paid = fields.get("return_code").map(String::as_str) == Some(SUCCESS)
            && fields.get("result_code").map(String::as_str) == Some(SUCCESS);
        let amount = fields
            .get("total_fee")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|fen| Decimal::new(fen, 2));

        info!(order_id = %order_id, paid, "wechat callback verified");
        Ok(CallbackNotification {
            provider: ProviderTag::Wechat,
            order_id,
            provider_txn_id: fields.get("transaction_id").cloned(),
            amount,
            outcome: if paid {
                CallbackOutcome::Paid
            } else {
                CallbackOutcome::Failed
            },
            fields,
            received_at: Utc::now(),
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Wechat
    }
}

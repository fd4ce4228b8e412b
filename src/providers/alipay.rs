//! Asymmetric-signature network adapter (Alipay open API).
//!
//! Requests are signed RSA2 (SHA-256 with RSA) with our private key; the
//! provider's own signature on responses and callbacks is verified with its
//! declared public key. Charge creation produces a signed order string the
//! mobile client hands to the provider SDK; query/refund/close go over HTTP
//! GET with query parameters.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

use crate::config::AlipayCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::provider::ProviderGateway;
use crate::signing::{rsa2_sign, rsa2_verify, sign_text};
use crate::transport::GatewayHttpClient;
use crate::types::{
    CallbackNotification, CallbackOutcome, ChargeRequest, ChargeResponse, HandoffPayload,
    ProviderResponse, ProviderTag, RefundRequest, TradeCriteria,
};
use crate::wire;

const METHOD_APP_PAY: &str = "alipay.trade.app.pay";
const METHOD_QUERY: &str = "alipay.trade.query";
const METHOD_REFUND: &str = "alipay.trade.refund";
const METHOD_CLOSE: &str = "alipay.trade.close";

const PRODUCT_CODE: &str = "QUICK_MSECURITY_PAY";
const CONTENT_LIMIT: usize = 128;
const SUCCESS_CODE: &str = "10000";

pub struct AlipayProvider {
    credentials: AlipayCredentials,
    http: GatewayHttpClient,
}

impl AlipayProvider {
    pub fn new(credentials: AlipayCredentials) -> GatewayResult<Self> {
        credentials.validate()?;
        let http = GatewayHttpClient::new(Duration::from_secs(credentials.timeout_secs))?;
        Ok(Self { credentials, http })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(AlipayCredentials::from_env()?)
    }

    /// Fixed base parameter set shared by every open-API method.
    fn base_params(&self, method: &str, biz_content: &JsonValue) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.credentials.app_id.clone());
        params.insert("method".to_string(), method.to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert(
            "timestamp".to_string(),
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        params.insert("version".to_string(), "1.0".to_string());
        params.insert("biz_content".to_string(), biz_content.to_string());
        params
    }

    /// Signs over the canonical form with `sign_type` retained and `sign`
    /// excluded, then appends the signature.
    fn sign_params(&self, mut params: BTreeMap<String, String>) -> GatewayResult<BTreeMap<String, String>> {
        let message = sign_text(&params, false, true);
        let signature = rsa2_sign(&self.credentials.private_key_pem, &message)?;
        params.insert("sign".to_string(), signature);
        Ok(params)
    }

    async fn execute(&self, method: &str, biz_content: JsonValue) -> GatewayResult<ProviderResponse> {
        let params = self.sign_params(self.base_params(method, &biz_content))?;
        let raw = self
            .http
            .get_query(&self.credentials.gateway_url, &params)
            .await?;
        self.decode_response(method, raw)
    }

    fn decode_response(&self, method: &str, raw: String) -> GatewayResult<ProviderResponse> {
        let response_key = format!("{}_response", method.replace('.', "_"));
        let document: JsonValue =
            serde_json::from_str(&raw).map_err(|e| GatewayError::WireDecoding {
                message: format!("provider response is not valid JSON: {}", e),
            })?;
        let payload = document
            .get(&response_key)
            .and_then(JsonValue::as_object)
            .ok_or_else(|| GatewayError::WireDecoding {
                message: format!("provider response is missing {}", response_key),
            })?;

        // The provider signs the literal JSON text of the response object,
        // so verification must run over the raw body, not a re-serialization.
        match document.get("sign").and_then(JsonValue::as_str) {
            Some(signature) => {
                let source = extract_response_source(&raw, &response_key)?;
                rsa2_verify(
                    &self.credentials.provider_public_key_pem,
                    source,
                    signature,
                )?;
            }
            None => {
                warn!(method, "provider response carries no signature");
            }
        }

        let fields = flatten_object(payload);
        let code = fields.get("code").cloned().unwrap_or_default();
        if code != SUCCESS_CODE {
            let message = fields
                .get("sub_msg")
                .or_else(|| fields.get("msg"))
                .cloned()
                .unwrap_or_else(|| "provider refused the request".to_string());
            return Err(GatewayError::ProviderBusiness {
                provider: ProviderTag::Alipay.to_string(),
                message,
                provider_code: fields.get("sub_code").or(Some(&code)).cloned(),
            });
        }

        Ok(ProviderResponse {
            provider: ProviderTag::Alipay,
            raw,
            fields,
        })
    }

    fn refund_biz_content(request: &RefundRequest) -> JsonValue {
        let mut biz = Map::new();
        if let Some(order_id) = &request.order_id {
            biz.insert("out_trade_no".to_string(), json!(order_id));
        }
        if let Some(txn_id) = &request.provider_txn_id {
            biz.insert("trade_no".to_string(), json!(txn_id));
        }
        biz.insert(
            "refund_amount".to_string(),
            json!(request.amount.normalize().to_string()),
        );
        biz.insert("out_request_no".to_string(), json!(request.refund_id));
        if let Some(reason) = &request.reason {
            biz.insert("refund_reason".to_string(), json!(reason));
        }
        JsonValue::Object(biz)
    }

    fn criteria_biz_content(criteria: &TradeCriteria) -> JsonValue {
        let mut biz = Map::new();
        if let Some(order_id) = &criteria.order_id {
            biz.insert("out_trade_no".to_string(), json!(order_id));
        }
        if let Some(txn_id) = &criteria.provider_txn_id {
            biz.insert("trade_no".to_string(), json!(txn_id));
        }
        JsonValue::Object(biz)
    }
}

#[async_trait]
impl ProviderGateway for AlipayProvider {
    async fn create_charge(&self, request: ChargeRequest) -> GatewayResult<ChargeResponse> {
        request.validate()?;

        let content: String = request.content.chars().take(CONTENT_LIMIT).collect();
        let mut biz = Map::new();
        if let Some(minutes) = request.timeout_minutes {
            biz.insert("timeout_express".to_string(), json!(format!("{}m", minutes)));
        }
        biz.insert(
            "total_amount".to_string(),
            json!(request.amount.normalize().to_string()),
        );
        biz.insert("seller_id".to_string(), json!(self.credentials.seller_id));
        biz.insert("product_code".to_string(), json!(PRODUCT_CODE));
        biz.insert("body".to_string(), json!(content));
        biz.insert("subject".to_string(), json!(request.subject));
        biz.insert("out_trade_no".to_string(), json!(request.order_id));
        if let Some(passback) = &request.passback {
            biz.insert("passback_params".to_string(), json!(passback));
        }

        let mut params = self.base_params(METHOD_APP_PAY, &JsonValue::Object(biz));
        params.insert("notify_url".to_string(), request.callback_url.clone());
        let params = self.sign_params(params)?;

        info!(order_id = %request.order_id, "alipay charge built");
        Ok(ChargeResponse {
            provider: ProviderTag::Alipay,
            order_id: request.order_id,
            handoff: HandoffPayload::OrderString(wire::to_query(&params)),
        })
    }

    async fn query(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse> {
        criteria.validate()?;
        self.execute(METHOD_QUERY, Self::criteria_biz_content(&criteria))
            .await
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ProviderResponse> {
        request.validate()?;
        info!(refund_id = %request.refund_id, "alipay refund requested");
        self.execute(METHOD_REFUND, Self::refund_biz_content(&request))
            .await
    }

    async fn close(&self, criteria: TradeCriteria) -> GatewayResult<ProviderResponse> {
        criteria.validate()?;
        self.execute(METHOD_CLOSE, Self::criteria_biz_content(&criteria))
            .await
    }

    fn verify_and_decode(&self, raw_payload: &[u8]) -> GatewayResult<CallbackNotification> {
        let text = std::str::from_utf8(raw_payload).map_err(|_| GatewayError::WireDecoding {
            message: "callback payload is not valid UTF-8".to_string(),
        })?;
        let fields = wire::from_query(text)?;

        let signature = fields
            .get("sign")
            .cloned()
            .ok_or_else(|| GatewayError::SignatureMismatch {
                message: "callback carries no signature".to_string(),
            })?;
        // Callback canonical form drops both sign and sign_type.
        let message = sign_text(&fields, false, false);
        rsa2_verify(&self.credentials.provider_public_key_pem, &message, &signature)?;

        let order_id = fields
            .get("out_trade_no")
            .cloned()
            .ok_or_else(|| GatewayError::WireDecoding {
                message: "callback is missing out_trade_no".to_string(),
            })?;
        let outcome = match fields.get("trade_status").map(String::as_str) {
            Some("TRADE_SUCCESS") | Some("TRADE_FINISHED") => CallbackOutcome::Paid,
            Some("TRADE_CLOSED") => CallbackOutcome::Closed,
            Some("WAIT_BUYER_PAY") => CallbackOutcome::Pending,
            _ => CallbackOutcome::Failed,
        };

        info!(order_id = %order_id, outcome = ?outcome, "alipay callback verified");
        Ok(CallbackNotification {
            provider: ProviderTag::Alipay,
            order_id,
            provider_txn_id: fields.get("trade_no").cloned(),
            amount: fields
                .get("total_amount")
                .and_then(|v| v.parse::<Decimal>().ok()),
            outcome,
            fields,
            received_at: Utc::now(),
        })
    }

    fn tag(&self) -> ProviderTag {
        ProviderTag::Alipay
    }
}

/// Extracts the literal JSON source text of the response object, which is
/// the exact byte range the provider signed.
fn extract_response_source<'a>(raw: &'a str, response_key: &str) -> GatewayResult<&'a str> {
    let needle = format!("\"{}\"", response_key);
    let key_at = raw.find(&needle).ok_or_else(|| GatewayError::WireDecoding {
        message: format!("provider response is missing {}", response_key),
    })?;
    let rest = &raw[key_at + needle.len()..];
    let start = rest.find('{').ok_or_else(|| GatewayError::WireDecoding {
        message: "provider response object is malformed".to_string(),
    })?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in rest[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&rest[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Err(GatewayError::WireDecoding {
        message: "provider response object is unterminated".to_string(),
    })
}

fn flatten_object(payload: &Map<String, JsonValue>) -> BTreeMap<String, String> {
    payload
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect()
}

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use xunbao_pay::signing::{rsa2_sign, sign_text, SignType};
use xunbao_pay::{
    AlipayCredentials, Applied, CallbackOutcome, ChargeRequest, GatewayConfig, GatewayError,
    GatewayFactory, HandoffPayload, Order, OrderState, ProviderGateway, ProviderTag,
    WechatCredentials,
};

fn test_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
    let public = RsaPublicKey::from(&private);
    (
        private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private pem")
            .to_string(),
        public
            .to_public_key_pem(LineEnding::LF)
            .expect("public pem"),
    )
}

fn factory_with_alipay(private_pem: String, public_pem: String) -> GatewayFactory {
    GatewayFactory::with_config(GatewayConfig {
        alipay: Some(AlipayCredentials {
            app_id: "2021000100000001".to_string(),
            seller_id: "2088000000000001".to_string(),
            private_key_pem: private_pem,
            provider_public_key_pem: public_pem,
            gateway_url: "https://openapi.alipay.com/gateway.do".to_string(),
            callback_url: "https://example.com/pay/ali/callback".to_string(),
            timeout_secs: 5,
        }),
        wechat: Some(WechatCredentials {
            app_id: "wx0000000000000001".to_string(),
            merchant_id: "1900000001".to_string(),
            api_key: "integration-secret".to_string(),
            sign_type: SignType::Md5,
            client_identity_pem: None,
            base_url: "https://api.mch.weixin.qq.com".to_string(),
            callback_url: "https://example.com/pay/wechat/callback".to_string(),
            timeout_secs: 5,
        }),
    })
}

fn alipay_callback_payload(private_pem: &str, order_id: &str, trade_status: &str) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("out_trade_no".to_string(), order_id.to_string());
    fields.insert("trade_no".to_string(), "2024010122001400001".to_string());
    fields.insert("trade_status".to_string(), trade_status.to_string());
    fields.insert("total_amount".to_string(), "9.99".to_string());
    let message = sign_text(&fields, false, false);
    let signature = rsa2_sign(private_pem, &message).expect("sign");
    fields.insert("sign".to_string(), signature);
    fields.insert("sign_type".to_string(), "RSA2".to_string());
    xunbao_pay::wire::to_query(&fields)
}

#[tokio::test]
async fn charge_to_paid_flow_with_verified_callback() {
    let (private_pem, public_pem) = test_keypair();
    let factory = factory_with_alipay(private_pem.clone(), public_pem);

    let mut order = Order::new(
        ProviderTag::Alipay,
        Decimal::new(999, 2),
        "widget",
        Some(90),
    );

    let provider = factory.get_provider(ProviderTag::Alipay).expect("provider");
    let response = provider
        .create_charge(ChargeRequest {
            order_id: order.order_id.clone(),
            amount: order.amount,
            subject: order.subject.clone(),
            content: "one widget".to_string(),
            passback: Some("session%3Dabc".to_string()),
            callback_url: "https://example.com/pay/ali/callback".to_string(),
            timeout_minutes: order.timeout_minutes,
            client_ip: None,
        })
        .await
        .expect("charge");
    assert!(matches!(response.handoff, HandoffPayload::OrderString(_)));
    order.mark_submitted().expect("submitted");

    let payload = alipay_callback_payload(&private_pem, &order.order_id, "TRADE_SUCCESS");
    let notification = factory
        .verify_and_decode(payload.as_bytes(), ProviderTag::Alipay)
        .expect("verified");
    assert_eq!(notification.outcome, CallbackOutcome::Paid);

    assert_eq!(
        order.apply_callback(&notification).expect("apply"),
        Applied::Transitioned(OrderState::Paid)
    );
    // Redelivery of the same verified callback is a no-op.
    assert_eq!(
        order.apply_callback(&notification).expect("redelivery"),
        Applied::AlreadyFinal
    );
    assert_eq!(order.state, OrderState::Paid);
}

#[tokio::test]
async fn forged_callback_never_moves_an_order() {
    let (private_pem, public_pem) = test_keypair();
    let (attacker_private, _) = test_keypair();
    let factory = factory_with_alipay(private_pem, public_pem);

    let mut order = Order::new(
        ProviderTag::Alipay,
        Decimal::new(999, 2),
        "widget",
        Some(90),
    );
    order.mark_submitted().expect("submitted");

    let payload = alipay_callback_payload(&attacker_private, &order.order_id, "TRADE_SUCCESS");
    let result = factory.verify_and_decode(payload.as_bytes(), ProviderTag::Alipay);
    assert!(matches!(result, Err(GatewayError::SignatureMismatch { .. })));
    assert_eq!(order.state, OrderState::Submitted);
}

#[test]
fn wechat_callback_with_wrong_secret_leaves_order_unchanged() {
    let (private_pem, public_pem) = test_keypair();
    let factory = factory_with_alipay(private_pem, public_pem);

    let mut order = Order::new(
        ProviderTag::Wechat,
        Decimal::new(999, 2),
        "widget",
        Some(90),
    );
    order.mark_submitted().expect("submitted");

    // Fields are correct, but the signature was computed under a different
    // shared secret than the gateway's.
    let mut fields = BTreeMap::new();
    fields.insert("appid".to_string(), "wx0000000000000001".to_string());
    fields.insert("mch_id".to_string(), "1900000001".to_string());
    fields.insert("nonce_str".to_string(), "n1".to_string());
    fields.insert("out_trade_no".to_string(), order.order_id.clone());
    fields.insert("return_code".to_string(), "SUCCESS".to_string());
    fields.insert("result_code".to_string(), "SUCCESS".to_string());
    fields.insert("total_fee".to_string(), "999".to_string());
    let forged_sign = xunbao_pay::signing::keyed_sign(&fields, "wrong-secret", SignType::Md5);
    fields.insert("sign".to_string(), forged_sign);
    let payload = xunbao_pay::wire::to_xml(&fields).expect("encode");

    let result = factory.verify_and_decode(&payload, ProviderTag::Wechat);
    assert!(matches!(result, Err(GatewayError::SignatureMismatch { .. })));
    assert_eq!(order.state, OrderState::Submitted);
}

#[test]
fn expiry_then_close_path() {
    let mut order = Order::new(
        ProviderTag::Alipay,
        Decimal::new(100, 2),
        "widget",
        Some(1),
    );
    order.mark_submitted().expect("submitted");

    let later = order.created_at + chrono::Duration::minutes(2);
    assert_eq!(order.check_expiry(later), OrderState::Expired);
    assert_eq!(
        order.mark_closed().expect("closed"),
        Applied::Transitioned(OrderState::Closed)
    );
}

#[test]
fn providers_expose_their_tags_through_the_factory() {
    let (private_pem, public_pem) = test_keypair();
    let factory = factory_with_alipay(private_pem, public_pem);
    assert_eq!(
        factory.configured_providers(),
        vec![ProviderTag::Alipay, ProviderTag::Wechat]
    );
    let provider = factory.get_provider(ProviderTag::Wechat).expect("provider");
    assert_eq!(provider.tag(), ProviderTag::Wechat);
}

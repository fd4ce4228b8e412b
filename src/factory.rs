use std::str::FromStr;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::provider::ProviderGateway;
use crate::providers::{AlipayProvider, WechatProvider};
use crate::types::{CallbackNotification, ProviderTag};

/// Tagged-variant dispatch over the configured providers.
///
/// Each provider is an independent implementation of the shared capability
/// set; there is no shared mutable state between them, so a factory and its
/// providers may be used concurrently without locks.
pub struct GatewayFactory {
    config: GatewayConfig,
}

impl GatewayFactory {
    pub fn from_env() -> GatewayResult<Self> {
        Ok(Self {
            config: GatewayConfig::from_env()?,
        })
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn get_provider(&self, tag: ProviderTag) -> GatewayResult<Box<dyn ProviderGateway>> {
        match tag {
            ProviderTag::Alipay => {
                let credentials =
                    self.config
                        .alipay
                        .clone()
                        .ok_or_else(|| GatewayError::Configuration {
                            message: "alipay credentials are not configured".to_string(),
                        })?;
                Ok(Box::new(AlipayProvider::new(credentials)?))
            }
            ProviderTag::Wechat => {
                let credentials =
                    self.config
                        .wechat
                        .clone()
                        .ok_or_else(|| GatewayError::Configuration {
                            message: "wechat credentials are not configured".to_string(),
                        })?;
                Ok(Box::new(WechatProvider::new(credentials)?))
            }
        }
    }

    pub fn get_provider_by_name(&self, name: &str) -> GatewayResult<Box<dyn ProviderGateway>> {
        self.get_provider(ProviderTag::from_str(name)?)
    }

    /// The single inbound surface: authenticates and decodes a provider
    /// callback payload. The hosting web layer receives the HTTP request
    /// and hands the raw body here.
    pub fn verify_and_decode(
        &self,
        raw_payload: &[u8],
        tag: ProviderTag,
    ) -> GatewayResult<CallbackNotification> {
        self.get_provider(tag)?.verify_and_decode(raw_payload)
    }

    pub fn configured_providers(&self) -> Vec<ProviderTag> {
        let mut tags = Vec::new();
        if self.config.alipay.is_some() {
            tags.push(ProviderTag::Alipay);
        }
        if self.config.wechat.is_some() {
            tags.push(ProviderTag::Wechat);
        }
        tags
    }
}

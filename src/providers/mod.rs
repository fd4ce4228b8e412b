pub mod alipay;
pub mod wechat;

pub use alipay::AlipayProvider;
pub use wechat::WechatProvider;

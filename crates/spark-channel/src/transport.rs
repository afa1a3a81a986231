//! # transport：被消费的传输层契约
//!
//! ## 意图（Why）
//! - 具体传输（HTTP/TCP/管道）与绑定协商不在本 crate 范围内，但通道工厂与通道需要把
//!   Open/Close/Abort 直接委托给它们；
//! - 传输栈暴露与生命周期引擎相同的契约，使 [`crate::ChannelFactory`] 可以递归复用引擎语义。
//!
//! ## 契约（What）
//! - `open`/`close` 接收本步骤的剩余额度，超出额度应返回 `Timeout` 分类错误；
//! - `abort` 不得阻塞、不得失败，可以在任意状态下调用；
//! - `create_channel` 只构造通道对象，不做网络 I/O，通道的打开由调用方驱动。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::endpoint::{BindingId, EndpointAddress, EndpointDescription};
use crate::error::Result;

/// 通道形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelShape {
    /// 请求-应答。
    RequestReply,
    /// 单向发送。
    OneWay,
    /// 双工，需要回调实例。
    Duplex,
}

impl ChannelShape {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelShape::RequestReply => "request_reply",
            ChannelShape::OneWay => "one_way",
            ChannelShape::Duplex => "duplex",
        }
    }
}

impl fmt::Display for ChannelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层通道。
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    fn shape(&self) -> ChannelShape;

    async fn open(&self, timeout: Duration) -> Result<()>;

    async fn close(&self, timeout: Duration) -> Result<()>;

    fn abort(&self);
}

/// 传输层通道工厂，打开代价高昂（元数据解析、凭据准备）。
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn open(&self, timeout: Duration) -> Result<()>;

    async fn close(&self, timeout: Duration) -> Result<()>;

    fn abort(&self);

    /// 构造一个指向 `address` 的通道。
    fn create_channel(
        &self,
        shape: ChannelShape,
        address: &EndpointAddress,
    ) -> Result<Box<dyn TransportChannel>>;
}

/// 绑定：为端点构造传输工厂，并给出结构化身份。
pub trait Binding: Send + Sync + 'static {
    /// 结构化身份，相同配置必须给出相同结果。
    fn identity(&self) -> BindingId;

    /// 是否支持给定的通道形态。
    fn supports(&self, shape: ChannelShape) -> bool {
        let _ = shape;
        true
    }

    /// 构造传输工厂；只做参数校验，不做 I/O。
    fn build_factory(&self, endpoint: &EndpointDescription) -> Result<Arc<dyn TransportFactory>>;
}

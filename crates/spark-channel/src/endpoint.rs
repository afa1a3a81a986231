//! # endpoint：端点描述与结构化端点特征
//!
//! ## 意图（Why）
//! - 判断两个代理能否共用一个通道工厂，必须比较“配置是否等价”，而不是比较对象引用；
//! - 配置加载层交付的是已解析的 [`EndpointDescription`]，本模块据此派生不可变的 [`EndpointTrait`]。
//!
//! ## 契约（What）
//! - [`EndpointTrait`] 的相等与哈希完全基于值：两个独立构造、描述同一配置的特征相等；
//! - 唯一的例外是回调实例：双工代理的回调对象本身就是身份，[`CallbackIdentity`] 以指针比较，
//!   并持有实例的 `Arc` 保证地址在特征存活期间不会被复用。

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{ChannelError, Result};
use crate::transport::{Binding, ChannelShape};

/// 服务契约的编译期描述。
///
/// 代理以契约类型区分共享域：同一契约类型的代理共享一个工厂缓存与一个策略闩锁。
pub trait ServiceContract: Send + Sync + 'static {
    /// 契约名称，参与端点特征比较。
    const NAME: &'static str;
    /// 契约要求的通道形态。
    const SHAPE: ChannelShape;
}

/// 契约标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId(Arc<str>);

impl ContractId {
    pub fn new(name: impl Into<Arc<str>>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ChannelError::argument_invalid("contract name must not be empty"));
        }
        Ok(Self(name))
    }

    pub fn of<C: ServiceContract>() -> Self {
        Self(Arc::from(C::NAME))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 绑定标识：同一配置下构造出的绑定必须给出相同的标识。
///
/// `fingerprint` 由绑定实现对其影响传输行为的全部设置做规范化摘要（如 `"timeout=30s;tls=off"`）。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId {
    scheme: Arc<str>,
    name: Arc<str>,
    fingerprint: Arc<str>,
}

impl BindingId {
    pub fn new(
        scheme: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        fingerprint: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            name: name.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// 已解析的端点地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    uri: Arc<str>,
    scheme_len: usize,
}

impl EndpointAddress {
    /// 解析形如 `scheme://authority/path` 的地址。
    ///
    /// 只校验结构，不做名称解析；空地址或缺少 scheme 返回 `ArgumentInvalid`。
    pub fn parse(uri: impl Into<Arc<str>>) -> Result<Self> {
        let uri = uri.into();
        let scheme_len = match uri.find("://") {
            Some(index) if index > 0 && uri.len() > index + 3 => index,
            _ => {
                return Err(ChannelError::argument_invalid(format!(
                    "endpoint address `{uri}` is not an absolute `scheme://` URI"
                )));
            }
        };
        Ok(Self { uri, scheme_len })
    }

    pub fn scheme(&self) -> &str {
        &self.uri[..self.scheme_len]
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// 回调实例身份。
#[derive(Clone)]
pub struct CallbackIdentity {
    instance: Arc<dyn Any + Send + Sync>,
}

impl CallbackIdentity {
    pub fn of<T: Any + Send + Sync>(instance: &Arc<T>) -> Self {
        Self {
            instance: Arc::clone(instance) as Arc<dyn Any + Send + Sync>,
        }
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.instance) as *const () as usize
    }
}

impl PartialEq for CallbackIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for CallbackIdentity {}

impl Hash for CallbackIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for CallbackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackIdentity({:#x})", self.address())
    }
}

/// 配置加载层交付的已解析端点。
#[derive(Clone)]
pub struct EndpointDescription {
    contract: ContractId,
    binding: Arc<dyn Binding>,
    address: EndpointAddress,
}

impl EndpointDescription {
    pub fn new(contract: ContractId, binding: Arc<dyn Binding>, address: EndpointAddress) -> Self {
        Self {
            contract,
            binding,
            address,
        }
    }

    pub fn contract(&self) -> &ContractId {
        &self.contract
    }

    pub fn binding(&self) -> &Arc<dyn Binding> {
        &self.binding
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }
}

impl fmt::Debug for EndpointDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescription")
            .field("contract", &self.contract)
            .field("binding", &self.binding.identity())
            .field("address", &self.address)
            .finish()
    }
}

/// 可互换配置的结构化键。
///
/// # 教案式说明
/// - **意图 (Why)**：工厂缓存以它为键，决定新代理能否复用已打开的工厂；
/// - **契约 (What)**：四元组 `{契约, 绑定, 地址, 回调实例}` 逐字段按值比较；构造后不可变；
/// - **风险 (Trade-offs)**：绑定实现若遗漏了影响传输行为的设置，会让本不等价的配置共用工厂，
///   因此 [`BindingId`] 的指纹必须覆盖全部相关设置。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointTrait {
    contract: ContractId,
    binding: BindingId,
    address: EndpointAddress,
    callback: Option<CallbackIdentity>,
}

impl EndpointTrait {
    pub fn new(
        contract: ContractId,
        binding: BindingId,
        address: EndpointAddress,
        callback: Option<CallbackIdentity>,
    ) -> Self {
        Self {
            contract,
            binding,
            address,
            callback,
        }
    }

    pub fn from_description(
        description: &EndpointDescription,
        callback: Option<CallbackIdentity>,
    ) -> Self {
        Self::new(
            description.contract().clone(),
            description.binding().identity(),
            description.address().clone(),
            callback,
        )
    }

    pub fn contract(&self) -> &ContractId {
        &self.contract
    }

    pub fn binding(&self) -> &BindingId {
        &self.binding
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn callback(&self) -> Option<&CallbackIdentity> {
        self.callback.as_ref()
    }
}

impl fmt::Display for EndpointTrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.contract.as_str(),
            self.address,
            self.binding.name()
        )?;
        if let Some(callback) = &self.callback {
            write!(f, "+cb{:#x}", callback.address())?;
        }
        Ok(())
    }
}

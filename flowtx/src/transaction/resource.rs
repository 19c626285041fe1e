use crate::errors::TxResult;
use crate::transaction::ManagedTransaction;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

// holder chains deeper than this are treated as cyclic
const MAX_HOLDER_DEPTH: usize = 32;

/// A wrapper around a resource factory.
///
/// Adapters often hand out holder objects that wrap the real factory. Two
/// different holders around the same factory must resolve to one resource
/// identity, so keys built from holders are normalized to the held factory.
pub trait ResourceFactoryHolder: Send + Sync {
    /// The factory behind this holder. May itself be another holder.
    fn held_factory(&self) -> ResourceKey;
}

/// Key under which a resource is bound to a transaction.
#[derive(Clone)]
pub enum ResourceKey {
    /// A resource factory object, compared by allocation identity.
    Object(Arc<dyn Any + Send + Sync>),
    /// A holder wrapping a resource factory.
    Holder(Arc<dyn ResourceFactoryHolder>),
    /// A logical name.
    Named(String),
}

impl ResourceKey {
    pub fn object<T: Any + Send + Sync>(factory: Arc<T>) -> Self {
        ResourceKey::Object(factory)
    }

    pub fn holder<H: ResourceFactoryHolder + 'static>(holder: Arc<H>) -> Self {
        ResourceKey::Holder(holder)
    }

    pub fn named(name: impl Into<String>) -> Self {
        ResourceKey::Named(name.into())
    }

    /// Unwraps holders until the underlying factory key is reached.
    pub fn normalize(&self) -> ResourceKey {
        let mut key = self.clone();
        for _ in 0..MAX_HOLDER_DEPTH {
            match key {
                ResourceKey::Holder(holder) => key = holder.held_factory(),
                other => return other,
            }
        }
        log::warn!("Resource holder chain exceeds {} levels, using the last holder as key", MAX_HOLDER_DEPTH);
        key
    }

    /// Identity of the normalized key.
    pub fn identity(&self) -> ResourceIdentity {
        match self.normalize() {
            ResourceKey::Object(factory) => ResourceIdentity::Object(Arc::as_ptr(&factory) as *const () as usize),
            ResourceKey::Holder(holder) => ResourceIdentity::Object(Arc::as_ptr(&holder) as *const () as usize),
            ResourceKey::Named(name) => ResourceIdentity::Named(name),
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self.normalize() {
            ResourceKey::Named(_) => KeyKind::Named,
            _ => KeyKind::Object,
        }
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ResourceKey {}

impl Debug for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Object(_) => write!(f, "ResourceKey::Object({:?})", self.identity()),
            ResourceKey::Holder(_) => write!(f, "ResourceKey::Holder({:?})", self.identity()),
            ResourceKey::Named(name) => write!(f, "ResourceKey::Named({})", name),
        }
    }
}

/// Hashable identity of a normalized resource key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceIdentity {
    Object(usize),
    Named(String),
}

/// Kind of a normalized resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Object,
    Named,
}

/// A handle that can take part in a distributed transaction.
pub trait XaResource: Send + Sync {
    fn name(&self) -> String;

    /// Applies the transaction timeout, in whole seconds, before enlistment.
    fn set_transaction_timeout(&self, _seconds: u32) -> TxResult<bool> {
        Ok(true)
    }

    /// Reusable handles stay open after the transaction ends.
    fn is_reusable(&self) -> bool {
        false
    }

    fn close(&self) -> TxResult<()>;
}

/// An enlistable handle that tracks its own enlistment, such as a pooled
/// connection.
pub trait SelfEnlistingResource: XaResource {
    fn enlist(&self, transaction: &Arc<dyn ManagedTransaction>) -> TxResult<bool>;

    fn delist(&self) -> TxResult<bool>;
}

/// A resource bound to a transaction.
///
/// The set of capabilities is closed: a resource is either a plain object
/// (local transactions only) or one of the two enlistable handle kinds.
#[derive(Clone)]
pub enum Resource {
    Plain(Arc<dyn Any + Send + Sync>),
    Xa(Arc<dyn XaResource>),
    SelfEnlisting(Arc<dyn SelfEnlistingResource>),
}

impl Resource {
    pub fn plain<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Resource::Plain(value)
    }

    pub fn xa<R: XaResource + 'static>(resource: Arc<R>) -> Self {
        Resource::Xa(resource)
    }

    pub fn self_enlisting<R: SelfEnlistingResource + 'static>(resource: Arc<R>) -> Self {
        Resource::SelfEnlisting(resource)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Plain(_) => ResourceKind::Plain,
            Resource::Xa(_) => ResourceKind::Xa,
            Resource::SelfEnlisting(_) => ResourceKind::SelfEnlisting,
        }
    }

    pub fn is_enlistable(&self) -> bool {
        !matches!(self, Resource::Plain(_))
    }

    /// Returns the plain object if it has type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Resource::Plain(value) => value.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// `true` if both refer to the same allocation.
    pub fn same_as(&self, other: &Resource) -> bool {
        self.address() == other.address()
    }

    pub(crate) fn is_reusable(&self) -> bool {
        match self {
            Resource::Plain(_) => true,
            Resource::Xa(r) => r.is_reusable(),
            Resource::SelfEnlisting(r) => r.is_reusable(),
        }
    }

    pub(crate) fn close(&self) -> TxResult<()> {
        match self {
            Resource::Plain(_) => Ok(()),
            Resource::Xa(r) => r.close(),
            Resource::SelfEnlisting(r) => r.close(),
        }
    }

    fn address(&self) -> usize {
        match self {
            Resource::Plain(value) => Arc::as_ptr(value) as *const () as usize,
            Resource::Xa(r) => Arc::as_ptr(r) as *const () as usize,
            Resource::SelfEnlisting(r) => Arc::as_ptr(r) as *const () as usize,
        }
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Plain(_) => write!(f, "Resource::Plain({:#x})", self.address()),
            Resource::Xa(r) => write!(f, "Resource::Xa({})", r.name()),
            Resource::SelfEnlisting(r) => write!(f, "Resource::SelfEnlisting({})", r.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Plain,
    Xa,
    SelfEnlisting,
}

/// Key and resource kinds a local transaction accepts, fixed when the
/// transaction factory is configured. `None` accepts any kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceConstraints {
    key: Option<KeyKind>,
    resource: Option<ResourceKind>,
}

impl ResourceConstraints {
    pub fn any() -> Self {
        ResourceConstraints::default()
    }

    pub fn new(key: KeyKind, resource: ResourceKind) -> Self {
        ResourceConstraints {
            key: Some(key),
            resource: Some(resource),
        }
    }

    pub fn accepts(&self, key: &ResourceKey, resource: &Resource) -> bool {
        let key_ok = self.key.map_or(true, |k| k == key.kind());
        let resource_ok = self.resource.map_or(true, |r| r == resource.kind());
        key_ok && resource_ok
    }
}

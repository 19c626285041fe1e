use crate::common::TxEventBus;
use crate::errors::TxResult;
use anyhow::Error;
use basu::error::BasuError;
use basu::event::Event;
use basu::Handle;
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Transaction lifecycle events published to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionEvents {
    Began,
    Committed,
    RolledBack,
}

impl Display for TransactionEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionEvents::Began => write!(f, "began"),
            TransactionEvents::Committed => write!(f, "committed"),
            TransactionEvents::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Payload of a lifecycle notification.
#[derive(Clone)]
pub struct TransactionEventInfo {
    inner: Arc<TransactionEventInner>,
}

struct TransactionEventInner {
    event_type: TransactionEvents,
    transaction_id: String,
    application_name: String,
    timestamp: DateTime<Utc>,
}

impl TransactionEventInfo {
    pub fn new(event_type: TransactionEvents, transaction_id: &str, application_name: &str) -> Self {
        TransactionEventInfo {
            inner: Arc::new(TransactionEventInner {
                event_type,
                transaction_id: transaction_id.to_string(),
                application_name: application_name.to_string(),
                timestamp: Utc::now(),
            }),
        }
    }

    pub fn event_type(&self) -> TransactionEvents {
        self.inner.event_type
    }

    pub fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    /// Name of the runtime that owns the transaction.
    pub fn application_name(&self) -> &str {
        &self.inner.application_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }
}

impl Debug for TransactionEventInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEventInfo")
            .field("event_type", &self.event_type())
            .field("transaction_id", &self.transaction_id())
            .field("application_name", &self.application_name())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

pub trait TransactionEventCallback: Send + Sync + Fn(TransactionEventInfo) -> TxResult<()> {}

impl<F> TransactionEventCallback for F where F: Send + Sync + Fn(TransactionEventInfo) -> TxResult<()> {}

/// Listener for transaction lifecycle notifications.
///
/// ```rust,ignore
/// runtime.subscribe(TransactionEventListener::new(|event| {
///     log::info!("{} {}", event.transaction_id(), event.event_type());
///     Ok(())
/// }))?;
/// ```
#[derive(Clone)]
pub struct TransactionEventListener {
    on_event: Arc<dyn TransactionEventCallback>,
}

impl TransactionEventListener {
    pub fn new(on_event: impl TransactionEventCallback + 'static) -> Self {
        TransactionEventListener {
            on_event: Arc::new(on_event),
        }
    }
}

impl Handle<TransactionEventInfo> for TransactionEventListener {
    fn handle(&self, event: &Event<TransactionEventInfo>) -> Result<(), BasuError> {
        match (self.on_event)(event.data.clone()) {
            Ok(_) => Ok(()),
            Err(e) => Err(BasuError::HandlerError(Error::from(e))),
        }
    }
}

impl Debug for TransactionEventListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEventListener").finish()
    }
}

pub(crate) type TransactionEventBus = TxEventBus<TransactionEventInfo, TransactionEventListener>;

/// Notification sink handed to every transaction.
///
/// Delivery is fire-and-forget: bus and listener failures are logged and
/// never reach the transaction operation that fired the event.
#[derive(Clone)]
pub struct TransactionNotifier {
    application_name: Arc<str>,
    event_bus: TransactionEventBus,
}

impl TransactionNotifier {
    pub(crate) fn new(application_name: &str, event_bus: TransactionEventBus) -> Self {
        TransactionNotifier {
            application_name: Arc::from(application_name),
            event_bus,
        }
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn fire(&self, event_type: TransactionEvents, transaction_id: &str) {
        if !self.event_bus.has_listeners() {
            return;
        }

        let info = TransactionEventInfo::new(event_type, transaction_id, &self.application_name);
        if let Err(e) = self.event_bus.publish(info) {
            log::warn!(
                "Failed to deliver '{}' notification for transaction {}: {}",
                event_type,
                transaction_id,
                e
            );
        }
    }
}

use crate::common::TRANSACTION_EVENT;
use crate::errors::{ErrorKind, TxError, TxResult};
use basu::error::BasuError;
use basu::event::Event;
use basu::{EventBus, Handle, HandlerId};
use std::marker::PhantomData;
use std::sync::Arc;

/// Publishes lifecycle events to registered listeners.
///
/// A thin wrapper over a basu [EventBus] bound to a single event type. Publishing
/// with no registered listener returns immediately without building an event.
///
/// ```ignore
/// let event_bus: TxEventBus<E, L> = TxEventBus::new();
/// let subscriber = event_bus.register(listener)?;
/// event_bus.publish(event)?;
/// event_bus.deregister(subscriber)?;
/// ```
#[derive(Clone)]
pub struct TxEventBus<E, L> {
    inner: Arc<TxEventBusInner<E, L>>,
}

impl<E, L> Default for TxEventBus<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, L> TxEventBus<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    pub fn new() -> Self {
        TxEventBus {
            inner: Arc::new(TxEventBusInner::new()),
        }
    }

    /// Registers an event listener with the bus.
    pub fn register(&self, listener: L) -> TxResult<Option<SubscriberRef>> {
        self.inner.register(listener)
    }

    /// Deregisters a previously registered event listener.
    pub fn deregister(&self, subscriber: SubscriberRef) -> TxResult<()> {
        self.inner.deregister(subscriber)
    }

    /// Publishes an event to all registered listeners.
    pub fn publish(&self, event: E) -> TxResult<()> {
        self.inner.publish(event)
    }

    /// Clears all registered listeners.
    pub fn close(&self) -> TxResult<()> {
        self.inner.close()
    }

    pub fn has_listeners(&self) -> bool {
        self.inner.has_listeners()
    }
}

/// Handle returned on registration, used to deregister the listener later.
pub struct SubscriberRef {
    pub(crate) inner: HandlerId,
}

impl SubscriberRef {
    pub fn new(inner: HandlerId) -> Self {
        SubscriberRef { inner }
    }
}

struct TxEventBusInner<E, L> {
    event_bus: EventBus<E>,
    phantom_data: PhantomData<L>,
}

impl<E, L> TxEventBusInner<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    fn new() -> Self {
        TxEventBusInner {
            event_bus: EventBus::new(),
            phantom_data: PhantomData,
        }
    }

    fn register(&self, listener: L) -> TxResult<Option<SubscriberRef>> {
        match self.event_bus.subscribe(TRANSACTION_EVENT, Box::new(listener)) {
            Ok(subscriber) => Ok(Some(SubscriberRef::new(subscriber))),
            Err(e) => Err(Self::tx_error(e)),
        }
    }

    #[inline]
    fn deregister(&self, subscriber: SubscriberRef) -> TxResult<()> {
        self.event_bus
            .unsubscribe(TRANSACTION_EVENT, &subscriber.inner)
            .map_err(Self::tx_error)
    }

    #[inline]
    fn publish(&self, event: E) -> TxResult<()> {
        let handler_count = match self.event_bus.get_handler_count(TRANSACTION_EVENT) {
            Ok(count) => count,
            Err(BasuError::EventTypeNotFOUND) => return Ok(()),
            Err(e) => return Err(Self::tx_error(e)),
        };

        if handler_count == 0 {
            return Ok(());
        }

        let basu_event = Event::new(event);
        self.event_bus
            .publish(TRANSACTION_EVENT, &basu_event)
            .map_err(Self::tx_error)
    }

    #[inline]
    fn close(&self) -> TxResult<()> {
        self.event_bus.clear().map_err(Self::tx_error)
    }

    #[inline]
    fn has_listeners(&self) -> bool {
        match self.event_bus.get_handler_count(TRANSACTION_EVENT) {
            Ok(count) => count > 0,
            Err(BasuError::EventTypeNotFOUND) => false,
            Err(e) => {
                log::warn!("Failed to check listeners: {}, defaulting to false", e);
                false
            }
        }
    }

    fn tx_error(e: BasuError) -> TxError {
        match e {
            BasuError::EventTypeNotFOUND => TxError::new(
                "Event bus error: no listener is registered for transaction events",
                ErrorKind::EventError,
            ),
            BasuError::MutexPoisoned => TxError::new(
                "Event bus error: internal mutex poisoned",
                ErrorKind::EventError,
            ),
            BasuError::HandlerError(e) => TxError::new(
                &format!("Event handler error: {}", e),
                ErrorKind::EventError,
            ),
        }
    }
}

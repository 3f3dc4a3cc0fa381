use std::{collections::HashMap, fmt, sync::Arc};

use super::{Event, EventKind, Propagation};
use crate::SupervisorError;

pub type HandlerResult = Result<Propagation, SupervisorError>;

/// A subscriber callback. It receives the context that owns the bus so it can
/// call back into the registry while handling the event.
pub type Handler<C> = Arc<dyn Fn(&mut C, &Event) -> HandlerResult + Send + Sync>;

/// Synchronous publish/subscribe keyed by [`EventKind`].
///
/// Handlers registered for a kind run in registration order on the caller's
/// task. A handler returning [`Propagation::Stop`] ends delivery of that event;
/// a handler returning an error ends it too and the error reaches the publisher.
pub struct EventBus<C> {
    listeners: HashMap<EventKind, Vec<Handler<C>>>,
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut C, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Snapshot of the handlers for `kind`. Subscriptions made while the
    /// snapshot is being dispatched only see later events.
    pub fn listeners(&self, kind: EventKind) -> Vec<Handler<C>> {
        self.listeners.get(&kind).cloned().unwrap_or_default()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for EventBus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self
            .listeners
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

/// Delivers `event` to `handlers` in order, stopping at the first `Stop` or error.
pub fn dispatch<C>(
    handlers: &[Handler<C>],
    ctx: &mut C,
    event: &Event,
) -> Result<(), SupervisorError> {
    for handler in handlers {
        match handler(ctx, event) {
            Ok(Propagation::Continue) => {}
            Ok(Propagation::Stop) => break,
            Err(source) => {
                return Err(SupervisorError::Handler {
                    event: event.kind(),
                    source: Box::new(source),
                })
            }
        }
    }
    Ok(())
}

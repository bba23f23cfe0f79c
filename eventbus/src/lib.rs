//! Typed, in-process, synchronous publish/subscribe.
//!
//! Handlers run on the publishing thread, in registration order. This
//! gives the pipeline a single global ordering: a frame is recorded by the
//! recording subscriber before the capture loop moves on, so nothing
//! downstream ever sees frames out of order.
//!
//! A handler returns [`Flow`] to signal backpressure (`Dropped`) and may
//! fail; failures are isolated (subsequent handlers still run), logged,
//! and forwarded to the [`ErrorBus`]. The aggregate [`PublishOutcome`]
//! lets publishers react: the capture loop counts `dropped`, the pitch
//! state machine reverts on `failed`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use pitch_types::{ErrorCategory, ErrorEvent, ErrorSeverity};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Handled,
    /// The handler's downstream queue was full; the event was discarded.
    /// Non-fatal: the publisher accounts for it.
    Dropped,
}

pub type HandlerResult = Result<Flow, BoxError>;

/// Aggregate result of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    /// Subscriber name, used in logs and bus-level error reports.
    name: String,
    /// Category attributed to failures of this handler.
    category: ErrorCategory,
    handler: Box<dyn Fn(&dyn Any) -> HandlerResult + Send + Sync>,
}

struct BusInner {
    table: RwLock<HashMap<TypeId, Vec<Arc<Entry>>>>,
    next_id: AtomicU64,
}

/// The event bus. Cheap to clone; clones share the subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                table: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `handler` for events of type `E`.
    ///
    /// `name` identifies the subscriber in logs; `category` is the error
    /// category attributed to this handler if it fails.
    pub fn subscribe<E, F>(
        &self,
        name: impl Into<String>,
        category: ErrorCategory,
        handler: F,
    ) -> SubscriptionId
    where
        E: Any + Send + Sync,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Entry {
            id,
            name: name.into(),
            category,
            handler: Box::new(move |any: &dyn Any| {
                // The table is keyed by TypeId, so this downcast holds.
                let ev = any.downcast_ref::<E>().unwrap();
                handler(ev)
            }),
        });
        let mut table = self.inner.table.write().unwrap();
        table.entry(TypeId::of::<E>()).or_default().push(entry);
        id
    }

    /// Convenience wrapper for handlers that never drop or fail.
    pub fn subscribe_infallible<E, F>(
        &self,
        name: impl Into<String>,
        category: ErrorCategory,
        handler: F,
    ) -> SubscriptionId
    where
        E: Any + Send + Sync,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe::<E, _>(name, category, move |ev| {
            handler(ev);
            Ok(Flow::Handled)
        })
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.inner.table.write().unwrap();
        for entries in table.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            if entries.len() != before {
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every subscriber for its type, synchronously,
    /// in registration order, on the calling thread.
    pub fn publish<E: Any + Send + Sync>(&self, event: &E) -> PublishOutcome {
        // Snapshot under the read lock, dispatch outside it, so handlers
        // may themselves publish or subscribe without deadlocking.
        let entries: Vec<Arc<Entry>> = {
            let table = self.inner.table.read().unwrap();
            match table.get(&TypeId::of::<E>()) {
                Some(v) => v.clone(),
                None => return PublishOutcome::default(),
            }
        };

        let is_error_event = TypeId::of::<E>() == TypeId::of::<ErrorEvent>();
        let mut outcome = PublishOutcome::default();
        for entry in entries {
            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(event))) {
                Ok(Ok(Flow::Handled)) => outcome.delivered += 1,
                Ok(Ok(Flow::Dropped)) => {
                    outcome.dropped += 1;
                    debug!("subscriber {} dropped an event", entry.name);
                }
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    self.report_handler_failure(&entry, is_error_event, &format!("{e}"));
                }
                Err(panic) => {
                    outcome.failed += 1;
                    let msg = panic_message(&panic);
                    self.report_handler_failure(&entry, is_error_event, &msg);
                }
            }
        }
        outcome
    }

    fn report_handler_failure(&self, entry: &Entry, is_error_event: bool, msg: &str) {
        error!("handler {} failed: {}", entry.name, msg);
        // A failing ErrorEvent handler is only logged: re-publishing would
        // recurse into the same handler.
        if !is_error_event {
            self.publish(&ErrorEvent::new(
                entry.category,
                ErrorSeverity::Error,
                entry.name.clone(),
                format!("event handler failed: {msg}"),
            ));
        }
    }

    /// The error-channel view of this bus.
    pub fn error_bus(&self) -> ErrorBus {
        ErrorBus { bus: self.clone() }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Categorized, severity-tagged error channel: a view over the bus that
/// stamps and publishes [`ErrorEvent`]s.
#[derive(Clone)]
pub struct ErrorBus {
    bus: EventBus,
}

impl ErrorBus {
    pub fn report(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) {
        let ev = ErrorEvent::new(category, severity, source, message);
        match severity {
            ErrorSeverity::Info => debug!("[{}] {}: {}", ev.category, ev.source, ev.message),
            ErrorSeverity::Warning => warn!("[{}] {}: {}", ev.category, ev.source, ev.message),
            _ => error!(
                "[{}/{}] {}: {}",
                ev.category, ev.severity, ev.source, ev.message
            ),
        }
        self.bus.publish(&ev);
    }

    /// Report with an attached metadata bag.
    pub fn report_with(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
        metadata: std::collections::BTreeMap<String, String>,
    ) {
        let mut ev = ErrorEvent::new(category, severity, source, message);
        ev.metadata = metadata;
        error!("[{}/{}] {}: {}", ev.category, ev.severity, ev.source, ev.message);
        self.bus.publish(&ev);
    }

    pub fn report_event(&self, ev: ErrorEvent) {
        self.bus.publish(&ev);
    }

    pub fn subscribe_errors<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.bus
            .subscribe_infallible::<ErrorEvent, _>(name, ErrorCategory::Shutdown, handler)
    }
}

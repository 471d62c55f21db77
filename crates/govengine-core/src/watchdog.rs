//! Watchdog listener subsystem.
//!
//! Each registered listener gets two tasks joined by a bounded queue: a
//! forwarder that reads the store's change feed and keeps the events that
//! match the listener's filter, and a worker that hands them to the listener
//! one at a time. Events reach one listener in order and never concurrently;
//! different listeners run in parallel. A full queue makes the forwarder wait,
//! and a forwarder that falls behind the feed logs how many events it lost.
//!
//! A listener that returns an error stays registered. One that panics stops
//! the whole watchdog, which then fails its engine action.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::context::WatchdogContext;
use crate::engine::panic_failure;
use crate::error::GovError;
use crate::handler::HandlerResult;
use crate::metadata::{EventFilter, MetadataEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives the metadata events a watchdog registered for.
///
/// An error is logged and the listener stays registered.
#[async_trait]
pub trait WatchdogListener: Send {
    async fn process_event(
        &mut self,
        event: &MetadataEvent,
        ctx: &WatchdogContext,
    ) -> HandlerResult<()>;
}

// ---------------------------------------------------------------------------
// ListenerSet
// ---------------------------------------------------------------------------

/// The listeners of one watchdog invocation.
pub(crate) struct ListenerSet {
    capacity: usize,
    next_id: AtomicU64,
    stops: Mutex<HashMap<ListenerId, watch::Sender<bool>>>,
    count: watch::Sender<usize>,
    failure: Mutex<Option<GovError>>,
}

/// Deregisters a listener when its worker exits, however it exits.
struct Registered {
    set: Arc<ListenerSet>,
    id: ListenerId,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

impl ListenerSet {
    pub(crate) fn new(capacity: usize) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            stops: Mutex::new(HashMap::new()),
            count,
            failure: Mutex::new(None),
        }
    }

    fn stops(&self) -> MutexGuard<'_, HashMap<ListenerId, watch::Sender<bool>>> {
        self.stops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn active(&self) -> usize {
        self.stops().len()
    }

    pub(crate) fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Start the forwarder and worker for `listener`.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<MetadataEvent>,
        filter: EventFilter,
        mut listener: Box<dyn WatchdogListener>,
        ctx: WatchdogContext,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (queue_tx, mut queue_rx) = mpsc::channel::<MetadataEvent>(self.capacity);
        let action = ctx.engine_action_guid().to_string();
        {
            let mut stops = self.stops();
            stops.insert(id, stop_tx);
            self.count.send_replace(stops.len());
        }

        let mut stop = stop_rx.clone();
        let forwarder_action = action.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !filter.matches(&event) {
                                continue;
                            }
                            tokio::select! {
                                biased;
                                _ = stop.changed() => break,
                                sent = queue_tx.send(event) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                engine_action = %forwarder_action,
                                listener = %id,
                                skipped,
                                "listener fell behind the change feed"
                            );
                        }
                        Err(RecvError::Closed) => {
                            debug!(engine_action = %forwarder_action, listener = %id, "change feed closed");
                            break;
                        }
                    },
                }
            }
        });

        let mut stop = stop_rx;
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let _registered = Registered {
                set: Arc::clone(&set),
                id,
            };
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    next = queue_rx.recv() => {
                        let Some(event) = next else { break };
                        let delivery_ctx = ctx.clone();
                        let delivery = tokio::spawn(async move {
                            let result = listener.process_event(&event, &delivery_ctx).await;
                            (listener, event, result)
                        });
                        match delivery.await {
                            Ok((returned, event, result)) => {
                                listener = returned;
                                if let Err(failure) = result {
                                    warn!(
                                        engine_action = %action,
                                        listener = %id,
                                        event = %event.kind,
                                        element = %event.element_guid,
                                        error = %failure,
                                        "listener failed to process event"
                                    );
                                }
                            }
                            Err(join) => {
                                let failure = panic_failure(join, "process_event");
                                warn!(
                                    engine_action = %action,
                                    listener = %id,
                                    error = %failure,
                                    "listener panicked; stopping the watchdog"
                                );
                                set.fail(failure);
                                break;
                            }
                        }
                    }
                }
            }
        });

        id
    }

    /// Stop one listener. Returns false if it was not registered.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut stops = self.stops();
        let Some(stop) = stops.remove(&id) else {
            return false;
        };
        stop.send_replace(true);
        self.count.send_replace(stops.len());
        true
    }

    /// Record a fatal listener failure and stop every listener, so the
    /// watchdog settles and reports it.
    fn fail(&self, failure: GovError) {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(failure);
        self.stop_all();
    }

    pub(crate) fn take_failure(&self) -> Option<GovError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn stop_all(&self) {
        let mut stops = self.stops();
        for (_, stop) in stops.drain() {
            stop.send_replace(true);
        }
        self.count.send_replace(0);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

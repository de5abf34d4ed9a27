//! Routing of inbound messages to subscribed handlers.
//!
//! This module provides the `HandlerRouter` which keeps the set of active
//! topic filters and invokes every matching handler once per inbound message.
//! Handler failures are contained here: errors and panics are logged and
//! never reach the transport loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::message::{InboundMessage, Qos};
use crate::topic::TopicFilter;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by message handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Callback invoked for each inbound message matching a subscription.
///
/// Handlers run on the transport's receive loop and must not block; hand
/// work off to a channel or task instead.
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message.
    fn on_message(&self, message: &InboundMessage) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> HandlerResult + Send + Sync,
{
    fn on_message(&self, message: &InboundMessage) -> HandlerResult {
        self(message)
    }
}

/// A registered subscription: filter, requested QoS and handler.
#[derive(Clone)]
pub struct Route {
    /// Topic filter the handler listens on
    pub filter: TopicFilter,
    /// QoS requested from the broker
    pub qos: Qos,
    handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Routes inbound messages to handlers by topic filter.
///
/// The router is also the source of truth for which filters must be
/// re-subscribed after a reconnect.
#[derive(Clone, Default)]
pub struct HandlerRouter {
    routes: Arc<RwLock<Vec<Route>>>,
}

impl HandlerRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic filter.
    pub fn register(&self, filter: TopicFilter, qos: Qos, handler: Arc<dyn MessageHandler>) {
        self.routes.write().push(Route {
            filter,
            qos,
            handler,
        });
    }

    /// Remove every handler registered for `filter`.
    ///
    /// Returns the number of handlers removed.
    pub fn unregister(&self, filter: &TopicFilter) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|route| &route.filter != filter);
        before - routes.len()
    }

    /// Distinct filters with the QoS to request for each.
    pub fn filters(&self) -> Vec<(TopicFilter, Qos)> {
        let routes = self.routes.read();
        let mut filters: Vec<(TopicFilter, Qos)> = Vec::with_capacity(routes.len());
        for route in routes.iter() {
            if !filters.iter().any(|(f, _)| f == &route.filter) {
                filters.push((route.filter.clone(), route.qos));
            }
        }
        filters
    }

    /// Deliver a message to every matching handler.
    ///
    /// Returns the number of handlers that accepted the message. Handlers
    /// that return an error or panic are logged and counted as failures.
    pub fn route(&self, message: &InboundMessage) -> usize {
        // Clone out of the lock so handlers can register routes re-entrantly.
        let matching: Vec<Route> = self
            .routes
            .read()
            .iter()
            .filter(|route| route.filter.matches(&message.topic))
            .cloned()
            .collect();

        if matching.is_empty() {
            tracing::trace!("No handler for topic {}", message.topic);
            return 0;
        }

        let mut delivered = 0;
        for route in matching {
            match catch_unwind(AssertUnwindSafe(|| route.handler.on_message(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Handler for {} failed on topic {}: {}",
                        route.filter,
                        message.topic,
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        "Handler for {} panicked on topic {}",
                        route.filter,
                        message.topic
                    );
                }
            }
        }
        delivered
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

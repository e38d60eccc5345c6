use std::fmt;

use parking_lot::RwLock;

use crate::{filter_matches, Handler, SubscriptionId};

#[derive(Clone)]
struct Route {
    filter: String,
    id: SubscriptionId,
    handler: Handler,
}

/// Handler registry keyed by `(filter, id)`, shared by the bus implementations.
///
/// Lookups clone the matching handlers out of the lock so callers can await
/// them without holding it.
#[derive(Default)]
pub struct SubscriptionTable {
    routes: RwLock<Vec<Route>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a handler. Returns `true` when `filter` had no
    /// routes before this call.
    pub fn insert(&self, filter: &str, id: SubscriptionId, handler: Handler) -> bool {
        let mut routes = self.routes.write();
        if let Some(route) = routes
            .iter_mut()
            .find(|route| route.filter == filter && route.id == id)
        {
            route.handler = handler;
            return false;
        }
        let first = !routes.iter().any(|route| route.filter == filter);
        routes.push(Route {
            filter: filter.to_string(),
            id,
            handler,
        });
        first
    }

    /// Removes a handler. Returns `None` when the pair was not registered,
    /// otherwise whether it was the last route for `filter`.
    pub fn remove(&self, filter: &str, id: SubscriptionId) -> Option<bool> {
        let mut routes = self.routes.write();
        let index = routes
            .iter()
            .position(|route| route.filter == filter && route.id == id)?;
        routes.remove(index);
        Some(!routes.iter().any(|route| route.filter == filter))
    }

    pub fn matching(&self, topic: &str) -> Vec<Handler> {
        self.routes
            .read()
            .iter()
            .filter(|route| filter_matches(&route.filter, topic))
            .map(|route| route.handler.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, SubscriptionId)> {
        self.routes
            .read()
            .iter()
            .map(|route| (route.filter.clone(), route.id))
            .collect()
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("routes", &self.entries())
            .finish()
    }
}

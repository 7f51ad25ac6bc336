//! Client to route resolution over a validated topology.

use std::sync::Arc;

use pgmux_scheme::{RouteSpec, Topology, UserSpec};
use tracing::debug;

use crate::error::{RouterError, RouterResult};

/// Maps a client's startup parameters onto a route and a user entry.
///
/// Cheap to clone; every worker holds its own copy of the `Arc`.
#[derive(Clone, Debug)]
pub struct Router {
    topology: Arc<Topology>,
}

impl Router {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Pick the route for a client connecting to `database` as `user`.
    ///
    /// Routes are tried in declaration order. A route matches when its
    /// database filter (its `database`, or its `target` when unset) equals
    /// `database` and its user filter, if any, equals `user`. Without a
    /// match the default route is used.
    pub fn route(&self, database: &str, user: &str) -> RouterResult<Arc<RouteSpec>> {
        let matched = self.topology.routes().iter().find(|route| {
            let db = route.database.as_deref().unwrap_or(&route.target);
            db == database && route.user.as_deref().is_none_or(|u| u == user)
        });
        if let Some(route) = matched {
            debug!(database, user, route = %route.target, "route matched");
            return Ok(Arc::clone(route));
        }
        match self.topology.routing_default() {
            Some(route) => {
                debug!(database, user, route = %route.target, "default route");
                Ok(Arc::clone(route))
            }
            None => Err(RouterError::NoRoute {
                database: database.to_owned(),
                user: user.to_owned(),
            }),
        }
    }

    /// Find the user entry that authenticates `user`: the exact entry,
    /// else the default user. Denied entries are rejected.
    pub fn authenticate_target(&self, user: &str) -> RouterResult<Arc<UserSpec>> {
        let entry = self
            .topology
            .user(user)
            .or_else(|| self.topology.users_default())
            .ok_or_else(|| RouterError::UnknownUser(user.to_owned()))?;
        if entry.is_deny {
            return Err(RouterError::Denied(user.to_owned()));
        }
        Ok(Arc::clone(entry))
    }
}

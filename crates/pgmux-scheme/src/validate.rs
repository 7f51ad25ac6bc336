//! Scheme validation.
//!
//! [`validate`] checks a raw [`Scheme`] rule by rule and stops at the first
//! violation. It never touches its input: on success it builds a fresh
//! [`Topology`] with every mode resolved to an enum and every route bound
//! to its server, so a partially validated configuration cannot exist.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::error::{SchemeResult, ValidationError};
use crate::scheme::{Listen, Scheme, Server};
use crate::topology::{
    AuthMode, ListenSpec, PoolingMode, RouteSpec, RoutingMode, ServerSpec, TlsSpec, Topology,
    UserSpec, tls_mode_from_name,
};

/// Validate a scheme into a [`Topology`].
pub fn validate(scheme: &Scheme) -> SchemeResult<Topology> {
    let pooling = {
        let name = scheme.pooling.as_deref().ok_or(ValidationError::PoolingNotSet)?;
        PoolingMode::from_name(name)
            .ok_or_else(|| ValidationError::UnknownPooling(name.to_owned()))?
    };

    if scheme.workers == 0 {
        return Err(ValidationError::BadWorkers.into());
    }

    let routing = {
        let name = scheme.routing.as_deref().ok_or(ValidationError::RoutingNotSet)?;
        RoutingMode::from_name(name)
            .ok_or_else(|| ValidationError::UnknownRouting(name.to_owned()))?
    };

    let listen = listen_spec(&scheme.listen)?;
    let (servers, server_index) = server_specs(&scheme.servers)?;

    // Routes.
    let mut routes = Vec::with_capacity(scheme.routes.len());
    let mut route_index = HashMap::with_capacity(scheme.routes.len());
    let mut routing_default = None;
    for route in &scheme.routes {
        let server_name = route
            .route
            .as_deref()
            .ok_or_else(|| ValidationError::NoRouteServer(route.target.clone()))?;
        let server = server_index
            .get(server_name)
            .map(|&i| Arc::clone(&servers[i]))
            .ok_or_else(|| ValidationError::RouteServerNotFound {
                route: route.target.clone(),
                server: server_name.to_owned(),
            })?;
        if route.is_default {
            if routing_default.is_some() {
                return Err(ValidationError::MultipleDefaultRoutes.into());
            }
            routing_default = Some(routes.len());
        }
        match route_index.entry(route.target.clone()) {
            Entry::Occupied(_) => {
                return Err(ValidationError::DuplicateRoute(route.target.clone()).into());
            }
            Entry::Vacant(slot) => {
                slot.insert(routes.len());
            }
        }
        routes.push(Arc::new(RouteSpec {
            target: route.target.clone(),
            server,
            database: route.database.clone(),
            user: route.user.clone(),
            ttl: route.ttl,
            pool_size: route.pool_size,
            pool_timeout: route.pool_timeout,
            client_max: route.client_max,
            cancel: route.cancel,
            discard: route.discard,
            rollback: route.rollback,
            is_default: route.is_default,
        }));
    }

    // Users.
    if scheme.users.is_empty() {
        return Err(ValidationError::NoUsers.into());
    }
    let mut users = Vec::with_capacity(scheme.users.len());
    let mut user_index = HashMap::with_capacity(scheme.users.len());
    let mut users_default = None;
    for user in &scheme.users {
        let is_default = user.is_default_user();
        let Some(auth_name) = user.auth.as_deref() else {
            return Err(if is_default {
                ValidationError::DefaultUserAuthNotSet
            } else {
                ValidationError::UserAuthNotSet(user.name.clone())
            }
            .into());
        };
        let auth = AuthMode::from_name(auth_name).ok_or_else(|| ValidationError::UnknownAuthMode {
            user: user.name.clone(),
            mode: auth_name.to_owned(),
        })?;
        if auth.requires_password() && user.password.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::UserPasswordNotSet(user.name.clone()).into());
        }
        if is_default {
            if users_default.is_some() {
                return Err(ValidationError::MultipleDefaultUsers.into());
            }
            users_default = Some(users.len());
        }
        match user_index.entry(user.name.clone()) {
            Entry::Occupied(_) => {
                return Err(ValidationError::DuplicateUser(user.name.clone()).into());
            }
            Entry::Vacant(slot) => {
                slot.insert(users.len());
            }
        }
        users.push(Arc::new(UserSpec {
            name: user.name.clone(),
            password: user.password.clone(),
            auth,
            is_default,
            is_deny: user.is_deny,
        }));
    }

    tracing::debug!(
        servers = servers.len(),
        routes = routes.len(),
        users = users.len(),
        "scheme validated"
    );

    Ok(Topology {
        config_file: scheme.config_file.clone(),
        log_debug: scheme.log_debug,
        log_config: scheme.log_config,
        readahead: scheme.readahead,
        workers: scheme.workers,
        client_max: scheme.client_max,
        pooling,
        routing,
        listen,
        servers,
        server_index,
        routes,
        route_index,
        users,
        user_index,
        routing_default,
        users_default,
    })
}

fn listen_spec(listen: &Listen) -> Result<ListenSpec, ValidationError> {
    let mode = listen
        .tls_mode
        .as_deref()
        .map(|name| {
            tls_mode_from_name(name).ok_or_else(|| ValidationError::UnknownTlsMode(name.to_owned()))
        })
        .transpose()?;
    Ok(ListenSpec {
        host: listen.host.clone().unwrap_or_else(|| "*".to_owned()),
        port: listen.port,
        backlog: listen.backlog,
        nodelay: listen.nodelay,
        keepalive: listen.keepalive,
        tls: TlsSpec {
            mode,
            ca_file: listen.tls_ca_file.clone(),
            key_file: listen.tls_key_file.clone(),
            cert_file: listen.tls_cert_file.clone(),
            protocols: listen.tls_protocols.clone(),
        },
    })
}

type ServerTable = (Vec<Arc<ServerSpec>>, HashMap<String, usize>);

fn server_specs(raw: &[Server]) -> Result<ServerTable, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::NoServers);
    }
    let mut servers = Vec::with_capacity(raw.len());
    let mut index = HashMap::with_capacity(raw.len());
    for server in raw {
        let host = server
            .host
            .clone()
            .ok_or_else(|| ValidationError::NoServerHost(server.name.clone()))?;
        let mode = server
            .tls_mode
            .as_deref()
            .map(|name| {
                tls_mode_from_name(name).ok_or_else(|| ValidationError::UnknownServerTlsMode {
                    server: server.name.clone(),
                    mode: name.to_owned(),
                })
            })
            .transpose()?;
        match index.entry(server.name.clone()) {
            Entry::Occupied(_) => return Err(ValidationError::DuplicateServer(server.name.clone())),
            Entry::Vacant(slot) => {
                slot.insert(servers.len());
            }
        }
        servers.push(Arc::new(ServerSpec {
            id: servers.len(),
            name: server.name.clone(),
            host,
            port: server.port,
            tls: TlsSpec {
                mode,
                ca_file: server.tls_ca_file.clone(),
                key_file: server.tls_key_file.clone(),
                cert_file: server.tls_cert_file.clone(),
                protocols: server.tls_protocols.clone(),
            },
        }));
    }
    Ok((servers, index))
}

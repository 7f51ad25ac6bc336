//! Human-readable rendering of a validated topology.
//!
//! Printed line by line at startup when `log_config` is set.

use std::fmt;

use crate::topology::{TlsSpec, Topology};

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Append the optional TLS lines of one endpoint. `indent` and `width`
/// keep the key column aligned with the surrounding block.
fn tls_lines(lines: &mut Vec<String>, tls: &TlsSpec, indent: &str, width: usize) {
    if let Some(mode) = tls.mode {
        lines.push(format!("{indent}{:<width$}{mode}", "tls_mode"));
    }
    let files = [
        ("tls_ca_file", &tls.ca_file),
        ("tls_key_file", &tls.key_file),
        ("tls_cert_file", &tls.cert_file),
    ];
    for (key, path) in files {
        if let Some(path) = path {
            lines.push(format!("{indent}{key:<width$}{}", path.display()));
        }
    }
    if let Some(protocols) = &tls.protocols {
        lines.push(format!("{indent}{:<width$}{protocols}", "tls_protocols"));
    }
}

impl Topology {
    /// Render the configuration, one entry per line.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(path) = &self.config_file {
            lines.push(format!("using configuration file '{}'", path.display()));
            lines.push(String::new());
        }
        if self.log_debug {
            lines.push("log_debug       yes".to_owned());
        }
        if self.log_config {
            lines.push("log_config      yes".to_owned());
        }
        lines.push(format!("readahead       {}", self.readahead));
        lines.push(format!("pooling         {}", self.pooling));
        lines.push(format!("client_max      {}", self.client_max));
        lines.push(format!("workers         {}", self.workers));
        lines.push(String::new());

        let listen = &self.listen;
        lines.push("listen".to_owned());
        lines.push(format!("  host            {}", listen.host));
        lines.push(format!("  port            {}", listen.port));
        lines.push(format!("  backlog         {}", listen.backlog));
        lines.push(format!("  nodelay         {}", u8::from(listen.nodelay)));
        lines.push(format!("  keepalive       {}", listen.keepalive));
        tls_lines(&mut lines, &listen.tls, "  ", 16);
        lines.push(String::new());

        lines.push("servers".to_owned());
        for server in &self.servers {
            lines.push(format!("  {}", server.name));
            lines.push(format!("    host          {}", server.host));
            lines.push(format!("    port          {}", server.port));
            tls_lines(&mut lines, &server.tls, "    ", 14);
        }
        lines.push(String::new());

        lines.push("routing".to_owned());
        lines.push(format!("  mode {}", self.routing));
        for route in &self.routes {
            if route.is_default {
                lines.push(format!("  {} default", route.target));
            } else {
                lines.push(format!("  {}", route.target));
            }
            lines.push(format!("    server        {}", route.server.name));
            if let Some(database) = &route.database {
                lines.push(format!("    database      {database}"));
            }
            if let Some(user) = &route.user {
                lines.push(format!("    user          {user}"));
            }
            lines.push(format!("    ttl           {}", route.ttl));
            lines.push(format!("    cancel        {}", yes_no(route.cancel)));
            lines.push(format!("    rollback      {}", yes_no(route.rollback)));
            lines.push(format!("    discard       {}", yes_no(route.discard)));
            lines.push(format!("    client_max    {}", route.client_max));
            lines.push(format!("    pool_size     {}", route.pool_size));
            lines.push(format!("    pool_timeout  {}", route.pool_timeout));
        }
        lines.push(String::new());

        lines.push("users".to_owned());
        for user in &self.users {
            if user.is_default {
                lines.push("  default".to_owned());
            } else {
                lines.push(format!("  {}", user.name));
            }
            if user.is_deny {
                lines.push("    deny".to_owned());
            }
            lines.push(format!("    authentication {}", user.auth));
        }

        lines
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.dump() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

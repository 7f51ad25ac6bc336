//! `pgmuxd probe`: connect once to every configured server.

use std::sync::Arc;
use std::time::Duration;

use pgmux_machine::{MachineError, MachinePool};
use pgmux_router::{MachineConnector, RouterError, ServerConnector};
use pgmux_scheme::Topology;
use tracing::{error, info, warn};

/// Outcome counts of one probe run.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub servers: usize,
    pub failed: usize,
}

/// Start `workers` machines and connect to each server once, spreading
/// the probes round-robin over the machines.
pub async fn run(topology: Arc<Topology>, timeout: Duration) -> anyhow::Result<ProbeReport> {
    let pool = MachinePool::start(topology.workers as usize)?;
    info!(workers = pool.len(), "machines started");

    let connector = Arc::new(MachineConnector::new(timeout));
    let tasks: Vec<_> = topology
        .servers()
        .iter()
        .map(|server| {
            let server = Arc::clone(server);
            let connector = Arc::clone(&connector);
            pool.next().spawn(move |ctx| async move {
                let result = connector.connect(&ctx, &server).await.map(|t| t.is_tls());
                (server, result)
            })
        })
        .collect();

    let mut report = ProbeReport::default();
    for task in tasks {
        let (server, result) = task.join().await?;
        report.servers += 1;
        match result {
            Ok(tls) => info!(
                server = %server.name,
                host = %server.host,
                port = server.port,
                tls,
                "connected"
            ),
            Err(RouterError::Connect {
                source: MachineError::TimedOut,
                ..
            }) => {
                report.failed += 1;
                warn!(
                    server = %server.name,
                    host = %server.host,
                    port = server.port,
                    "timed out"
                );
            }
            Err(err) => {
                report.failed += 1;
                error!(server = %server.name, error = %err, "probe failed");
            }
        }
    }

    tokio::task::spawn_blocking(move || pool.shutdown()).await??;
    Ok(report)
}

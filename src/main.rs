use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use hostwatch::{Config, WatchError, Watcher};

#[derive(Parser)]
#[command(name = "hostwatch", about = "Watch host availability with ICMP echo probes")]
struct Args {
    /// Source address to bind probe sockets to
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// 'udp' | 'icmp'. Setting to 'icmp' requires super-user privileges.
    #[arg(long, default_value = "udp")]
    proto: String,

    /// Path to the hosts config file
    #[arg(long, default_value = "./hosts.json")]
    config: String,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostwatch=info".parse()?),
        )
        .init();

    let privileged = match args.proto.as_str() {
        "icmp" => true,
        "udp" => false,
        other => anyhow::bail!("wrong proto {other:?}, want 'udp' or 'icmp'"),
    };

    let config = Config::load(&args.config).await?;
    info!(
        hosts = config.hosts.len(),
        source = %args.address,
        proto = %args.proto,
        "starting watchers"
    );

    let mut rng = rand::rng();
    let mut watchers = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let mut w = Watcher::resolved(host.addr.clone(), &mut rng).await?;
        w.set_privileged(privileged);
        w.set_source(&args.address);
        w.set_size(host.packet_size);
        w.set_ttl(host.ttl);
        w.set_read_deadline(host.read_timeout());
        w.set_interval(host.interval());
        info!(
            addr = w.addr(),
            interval_ms = host.interval_ms,
            read_timeout_ms = host.read_timeout_ms,
            packet_size = host.packet_size,
            ttl = host.ttl,
            "watching"
        );
        watchers.push(Arc::new(w));
    }

    // First fatal watcher error ends the process; per-cycle errors stay
    // inside the watchers and only get logged.
    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel::<WatchError>(1);
    let mut tasks = Vec::with_capacity(watchers.len());
    for w in &watchers {
        let w = Arc::clone(w);
        let err_tx = err_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = w.run().await {
                let _ = err_tx.try_send(err);
            }
        }));
    }

    let outcome = tokio::select! {
        Some(err) = err_rx.recv() => {
            error!(error = %err, "watcher failed");
            Err(anyhow::Error::new(err))
        }
        res = shutdown_signal() => {
            match res {
                Ok(()) => {
                    info!("shutdown requested");
                    Ok(())
                }
                Err(err) => Err(anyhow::Error::new(err)),
            }
        }
    };

    for w in &watchers {
        info!(addr = w.addr(), "stopping");
        w.stop();
    }
    for task in tasks {
        let _ = task.await;
    }

    outcome
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

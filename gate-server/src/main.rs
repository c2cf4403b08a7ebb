use std::env;
use std::panic;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};

use gate_core::broker::memory::MemoryBroker;
use gate_core::broker::BrokerClient;
use gate_core::scheduler::{IndexerScheduler, SessionLocks};
use gate_server::cli::Args;
use gate_server::config::ServerConfig;
use gate_server::server::conn_status::ConnStatusRegistry;
use gate_server::server::{handle_connection, Server};
use gate_server::{tls as tls_support, trace};

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    if args.debug {
        println!("{args:?}");
    }

    let log_dir = format!("{}/.gate-server", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("gate-server starting, args: {args:?}");

    let config = Arc::new(ServerConfig::from_args(&args).context("invalid configuration")?);
    info!("gate-server config resolved: {config:?}");

    if config.brokers.is_empty() {
        log::warn!(
            target: "server_warnings",
            "no --brokers configured; running with the in-process broker fake (dry-run-equivalent, no real log topic)"
        );
    }

    let tls_acceptor = match &config.tls {
        Some(tls) => Some(tls_support::build_acceptor(tls).context("failed to load TLS keypair")?),
        None => None,
    };

    let broker: Arc<dyn BrokerClient> = Arc::new(MemoryBroker::with_callbacks(true, true));
    let indexer_scheduler = IndexerScheduler::new(config.parallel_indexers);
    let session_locks = SessionLocks::new();
    let conn_status = ConnStatusRegistry::new();
    conn_status.spawn_sweeper();

    spawn_sigusr1_handler(conn_status.clone());

    let listener = TcpListener::bind(config.bind).await.with_context(|| format!("failed to bind {}", config.bind))?;
    info!("listening on {}", config.bind);

    let server = Server { config: config.clone(), broker, indexer_scheduler, session_locks, conn_status };

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };

        if let Err(e) = apply_keepalive(&stream, config.tcp_keepalive_period) {
            log::warn!("failed to set keep-alive on {remote}: {e}");
        }

        let server = server.clone();
        let remote = remote.to_string();

        match &tls_acceptor {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_connection(server, tls_stream, remote).await,
                        Err(e) => log::warn!("{remote}: TLS handshake failed: {e}"),
                    }
                });
            }
            None => {
                tokio::spawn(handle_connection(server, stream, remote));
            }
        }
    }
}

fn apply_keepalive(stream: &TcpStream, period: std::time::Duration) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(period);
    sock_ref.set_tcp_keepalive(&keepalive)
}

/// `SIGUSR1` dumps process state to the log. Stable Rust has no
/// goroutine-style stack introspection, so this logs the live connection
/// snapshot instead of full task stacks.
fn spawn_sigusr1_handler(conn_status: Arc<ConnStatusRegistry>) {
    use signal_hook::consts::SIGUSR1;
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new(&[SIGUSR1]) {
        Ok(signals) => signals,
        Err(e) => {
            log::warn!("failed to register SIGUSR1 handler: {e}");
            return;
        }
    };

    let rt = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        for _ in signals.forever() {
            let conn_status = conn_status.clone();
            rt.block_on(async move {
                let snapshot = conn_status.snapshot().await;
                log::info!("SIGUSR1: {} live connection(s)", snapshot.len());
                for (id, state, topic, items_read) in snapshot {
                    log::info!("  conn {id}: {state:?} topic={topic:?} items_read={items_read}");
                }
            });
        }
    });
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);

            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta).expect("human-panic: printing error message to console failed");
        }));
    }
}

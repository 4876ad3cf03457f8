//! Push notification client binary.
//!
//! Runs the foreground broker connection for one session, hands the socket to
//! the in-process background host once registration completes, and resumes it
//! whenever the host reports activity on the parked socket.

use anyhow::Context;
use clap::Parser;
use push_lifecycle::{
    AccessStatus, FileLocks, InProcessHost, LifecycleConfig, LockGuard, SessionStore,
    SocketLifecycleManager,
};
use push_session::{
    make_client_config, ConnectionConfig, ConnectionState, PushConnection, PushEvent, PushSession,
    RegistrationConfig, TlsClientConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod logging;
mod session_store;

use config::PushConfig;
use http::ReqwestHttp;
use logging::PushLogFormatter;
use session_store::JsonSessionStore;

/// Push notification client
#[derive(Parser, Debug)]
#[command(name = "push-client", version, about = "Push notification client with background socket hand-off")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Session to run, overrides the configured session name
    #[arg(long)]
    session: Option<String>,

    /// Hand-off wait, e.g. 5s; overrides the configured wait time
    #[arg(long)]
    wait_time: Option<humantime::Duration>,

    /// Dispose the background socket, remove background triggers and exit
    #[arg(long)]
    unregister_tasks: bool,
}

type Manager = SocketLifecycleManager<InProcessHost>;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("push_client={}", args.log_level).parse()?)
        .add_directive(format!("push_session={}", args.log_level).parse()?)
        .add_directive(format!("push_wire={}", args.log_level).parse()?)
        .add_directive(format!("push_lifecycle={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(PushLogFormatter::new("push-client"))
        .init();

    info!("Starting push client v{}", env!("CARGO_PKG_VERSION"));

    let mut push_config = PushConfig::load_from_file(&args.config)?;
    if let Some(session) = args.session {
        push_config.session_name = session;
    }
    if let Some(wait_time) = args.wait_time {
        push_config.wait_time_secs = Duration::from(wait_time).as_secs();
    }

    let tls = load_tls(&push_config).await?;
    let lifecycle_config = LifecycleConfig {
        connection: ConnectionConfig {
            host: push_config.broker_host.clone(),
            port: push_config.broker_port,
            tls,
            keep_alive_secs: push_config.keep_alive_secs,
            registration: RegistrationConfig {
                package_name: push_config.package_name.clone(),
                app_id: push_config.app_id.clone(),
                ..Default::default()
            },
            ..Default::default()
        },
        wait_time: Duration::from_secs(push_config.wait_time_secs),
        ..Default::default()
    };

    let state_dir = PathBuf::from(&push_config.state_dir);
    let store = Arc::new(JsonSessionStore::new(state_dir.join("sessions")));
    let locks = Arc::new(FileLocks::new(state_dir.join("locks"))?);
    let (host, mut activations) = InProcessHost::new(AccessStatus::Allowed, push_config.reply_actions);
    let http = Arc::new(ReqwestHttp::new(&push_config.api_base, &push_config.user_agent)?);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let manager = Arc::new(
        SocketLifecycleManager::new(Arc::new(host), locks, store.clone(), http, lifecycle_config)
            .with_event_sink(event_tx),
    );

    let session_name = push_config.session_name.clone();
    if args.unregister_tasks {
        manager.dispose_background_socket(&session_name);
        manager.unregister_tasks();
        info!("Background tasks unregistered for {}", session_name);
        return Ok(());
    }

    let record = store
        .load(&session_name)
        .await?
        .with_context(|| {
            format!(
                "No session stored for {}; expected {}",
                session_name,
                store.path_for(&session_name).display()
            )
        })?;
    let session = Arc::new(PushSession::from_record(record));
    if !push_config.user_agent.is_empty() {
        session.push_data_mut().user_agent = push_config.user_agent.clone();
    }

    tokio::spawn(log_events(event_rx));

    let foreground = start_foreground(&manager, session.clone()).await?;

    let shutdown = CancellationToken::new();
    let mut running = JoinSet::new();
    info!("Push client started for {}. Waiting for activations...", session_name);

    loop {
        tokio::select! {
            activation = activations.recv() => {
                let Some(mut activation) = activation else {
                    info!("Activation channel closed, shutting down");
                    break;
                };
                activation.cancellation = shutdown.child_token();
                let manager = manager.clone();
                running.spawn(async move { manager.run_activation(activation).await });
            }

            Some(result) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = result {
                    warn!("Activation task failed: {}", e);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    while let Some(result) = running.join_next().await {
        if let Err(e) = result {
            warn!("Activation task failed: {}", e);
        }
    }

    if let Some(connection) = foreground {
        connection.shutdown().await;
        if let Err(e) = store.save(&connection.session().to_record()).await {
            warn!("Failed to save session {}: {}", session_name, e);
        }
    }

    info!("Push client shutdown complete");
    Ok(())
}

/// Build the broker TLS settings, or `None` for plain TCP
async fn load_tls(push_config: &PushConfig) -> anyhow::Result<Option<TlsClientConfig>> {
    if !push_config.tls.enabled {
        warn!("TLS disabled, connecting to the broker over plain TCP");
        return Ok(None);
    }

    let extra_ca = if push_config.tls.ca_file.is_empty() {
        None
    } else {
        let pem = tokio::fs::read_to_string(&push_config.tls.ca_file)
            .await
            .with_context(|| format!("Failed to read CA file {}", push_config.tls.ca_file))?;
        Some(pem)
    };

    let client_config = make_client_config(extra_ca.as_deref())?;
    Ok(Some(TlsClientConfig {
        client_config: Arc::new(client_config),
        server_name: push_config.broker_host.clone(),
    }))
}

/// Start the foreground connection while holding the foreground lock.
///
/// The lock is released once the connection hands its socket off or stops.
async fn start_foreground(
    manager: &Arc<Manager>,
    session: Arc<PushSession>,
) -> anyhow::Result<Option<PushConnection>> {
    let Some(lock) = manager
        .locks()
        .try_acquire_foreground_lock(session.session_name())?
    else {
        info!(
            "Another foreground instance runs {}, waiting for activations only",
            session.session_name()
        );
        return Ok(None);
    };

    let Some(connection) = manager.start_from_foreground(session).await else {
        return Ok(None);
    };

    tokio::spawn(hold_until_released(connection.clone(), lock));
    Ok(Some(connection))
}

async fn hold_until_released(connection: PushConnection, lock: LockGuard) {
    let mut state = connection.watch_state();
    let released = state
        .wait_for(|s| matches!(s, ConnectionState::Transferred | ConnectionState::Idle))
        .await
        .map(|s| *s);
    debug!(
        "Foreground connection {} ended ({:?}), releasing {}",
        connection.socket_id(),
        released,
        lock.path().display()
    );
    drop(lock);
}

async fn log_events(mut events: mpsc::UnboundedReceiver<(String, PushEvent)>) {
    while let Some((socket_id, event)) = events.recv().await {
        match event {
            PushEvent::MessageReceived(notification) => {
                component_info!(
                    "events",
                    "Direct message on {}: {} - {}",
                    socket_id,
                    notification.content.title.as_deref().unwrap_or("(no title)"),
                    notification.content.message.as_deref().unwrap_or("")
                );
            }
            PushEvent::ExceptionCaught(error) => {
                component_warn!("events", "Push error on {}: {}", socket_id, error);
            }
        }
    }
}

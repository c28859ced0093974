use peerdrop::core::connection::WebRtcConnector;
use peerdrop::core::coordinator::SessionCoordinator;
use peerdrop::core::notify::{AutoGateway, ChannelGateway, NotificationGateway};
use peerdrop::core::signaling::{RelaySender, SignalingChannel};
use peerdrop::core::store::{FileStore, SessionStore};
use peerdrop::utils::file_log::FileLogLayer;
use peerdrop::utils::sos::SignalOfStop;
use peerdrop::workers::args::Args;
use peerdrop::workers::cli::Cli;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Initialize the global data directory (must happen before any persistence access)
    let data_dir = peerdrop::utils::data_dir::init(args.data_dir.as_deref())?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings; they are harmless.
    let file_filter = match args.verbose {
        0 => "warn,peerdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    // stderr shares the terminal with the prompt, so it stays quiet unless asked.
    let stderr_filter = match args.verbose {
        0 => "warn,webrtc=error,webrtc_ice=error",
        _ => file_filter,
    };

    let log_path = data_dir.join("logs").join("peerdrop.log");
    let file_layer = FileLogLayer::new(&log_path)?;

    tracing_subscriber::registry()
        .with(file_layer.with_filter(EnvFilter::new(file_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(EnvFilter::new(stderr_filter)),
        )
        .init();

    info!(
        event = "startup",
        relay = %args.relay_url(),
        data_dir = %data_dir.display(),
        "Starting peerdrop"
    );

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let store: Arc<dyn SessionStore> = Arc::new(FileStore::open(data_dir));
    let link = Arc::new(SignalingChannel::new(args.relay_url()));
    let relay: Arc<dyn RelaySender> = link.clone();
    let connector = Arc::new(WebRtcConnector::new()?);

    let (gateway, prompts): (Arc<dyn NotificationGateway>, _) = if args.auto_accept {
        (Arc::new(AutoGateway::accepting()), None)
    } else if args.auto_deny {
        (Arc::new(AutoGateway::denying()), None)
    } else {
        let (gateway, rx) = ChannelGateway::new();
        (Arc::new(gateway), Some(rx))
    };

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let (coordinator, inbox) = SessionCoordinator::new(
        args.settings(),
        store,
        relay,
        connector,
        gateway,
        app_tx,
    );
    println!("You are {}.", coordinator.name());

    let session = tokio::spawn(coordinator.run(link, inbox, command_rx, sos.clone()));

    let cli = Cli::new(command_tx, args.download_dir());
    let result = cli.run(prompts, app_rx, sos.clone()).await;

    // The CLI dropped its command sender; the session winds down on its own.
    sos.cancel();
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(event = "session_failure", error = %e),
        Err(e) => error!(event = "session_panic", error = %e),
    }

    result
}

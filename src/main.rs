use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use neolia::backend::discovery::resolve_panel_config_by_code;
use neolia::backend::hass::{EntityMap, WsConnector};
use neolia::config;
use neolia::error::ApiResult;
use neolia::intercom::IncomingCallListener;
use neolia::panel::SensorSource;
use neolia::platform::{DisplayMode, PlatformInfo};
use neolia::recovery::{RecoveryHandler, Visibility, VisibilityDispatcher};
use neolia::server::agent::Agent;
use neolia::server::appstate::AppState;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Mobile,
    Tablet,
    Panel,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file (defaults to ./neolia.yaml when present)
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Force a display mode instead of detecting it
    #[arg(short, long)]
    mode: Option<ModeArg>,

    /// Resolve a panel code with the discovery service, print the result and exit
    #[arg(long)]
    code: Option<String>,
}

/*
 * Formatter function to output in syslog format. This makes sense when running
 * as a service (where output might go to a log file, or the system journal)
 */
#[allow(clippy::match_same_arms)]
fn syslog_format(
    buf: &mut pretty_env_logger::env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "<{}>{}: {}",
        match record.level() {
            log::Level::Error => 3,
            log::Level::Warn => 4,
            log::Level::Info => 6,
            log::Level::Debug => 7,
            log::Level::Trace => 7,
        },
        record.target(),
        record.args()
    )
}

fn init_logging() -> ApiResult<()> {
    /* Try to provide reasonable default filters, when RUST_LOG is not specified */
    const DEFAULT_LOG_FILTERS: &[&str] = &[
        "debug",
        "hyper_util=info",
        "reqwest=info",
        "tungstenite=info",
        "tokio_tungstenite=info",
    ];

    let log_filters = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTERS.join(","));

    /* Detect if we need syslog or human-readable formatting */
    if std::env::var("SYSTEMD_EXEC_PID").is_ok_and(|pid| pid == std::process::id().to_string()) {
        Ok(pretty_env_logger::env_logger::builder()
            .format(syslog_format)
            .parse_filters(&log_filters)
            .try_init()?)
    } else {
        Ok(pretty_env_logger::formatted_timed_builder()
            .parse_filters(&log_filters)
            .try_init()?)
    }
}

fn apply_mode(platform: &mut PlatformInfo, mode: ModeArg) {
    match mode {
        ModeArg::Panel => platform.panel_override = true,
        ModeArg::Tablet | ModeArg::Mobile => {
            platform.panel_override = false;
            platform.panel_build = false;
            platform.viewport_width = if matches!(mode, ModeArg::Mobile) {
                DisplayMode::MOBILE_MAX_WIDTH - 1
            } else {
                DisplayMode::MOBILE_MAX_WIDTH * 2
            };
        }
    }
}

fn install_signal_handlers(cancel: &CancellationToken) -> ApiResult<mpsc::Receiver<Visibility>> {
    async fn shutdown(msg: &str, cancel: CancellationToken) {
        log::warn!("{msg}");
        let _ = std::io::stderr().flush();
        cancel.cancel();
    }

    let token = cancel.clone();
    tokio::spawn(async move {
        if matches!(signal::ctrl_c().await, Ok(())) {
            shutdown("Ctrl-C pressed, exiting..", token).await;
        }
    });

    let token = cancel.clone();
    let mut signal = signal::unix::signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if matches!(signal.recv().await, Some(())) {
            shutdown("SIGTERM received, exiting..", token).await;
        }
    });

    // the native shell reports visibility changes through SIGUSR1/SIGUSR2
    let (tx, rx) = mpsc::channel(8);
    let mut hidden = signal::unix::signal(SignalKind::user_defined1())?;
    let mut visible = signal::unix::signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            let visibility = tokio::select! {
                Some(()) = hidden.recv() => Visibility::Hidden,
                Some(()) = visible.recv() => Visibility::Visible,
                else => break,
            };
            if tx.send(visibility).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

async fn resolve_code(config: &config::AppConfig, code: &str) -> ApiResult<()> {
    let res = resolve_panel_config_by_code(&config.discovery.url, code).await?;
    println!("{}", serde_json::to_string_pretty(&res)?);
    Ok(())
}

async fn run() -> ApiResult<()> {
    init_logging()?;

    let args = Args::parse();

    let config = config::parse(args.config.as_deref())?;
    log::debug!("Configuration loaded successfully");

    if let Some(code) = &args.code {
        return resolve_code(&config, code).await;
    }

    if !config.network.has_dev_network_config() && !config.has_discovery() {
        log::warn!("{}", "-".repeat(80));
        log::warn!("No development network and no discovery service configured!");
        log::warn!("The agent will use the stored credentials or the cloud instance.");
        log::warn!("{}", "-".repeat(80));
    }

    let mut platform = PlatformInfo::from_config(&config);
    if let Some(mode) = args.mode {
        apply_mode(&mut platform, mode);
    }
    log::info!(
        "Display mode: {:?} (native panel shell: {})",
        platform.display_mode(),
        platform.is_panel_mode()
    );

    let intercom = config.intercom.clone();
    let mqtt_bootstrap = config.mqtt.enabled;
    let recovery = config.recovery.clone();
    let kind = platform.kind();

    let appstate = AppState::with_parts(config, platform, Arc::new(WsConnector))?;
    let cancel = CancellationToken::new();
    let visibility = install_signal_handlers(&cancel)?;

    let _entities = appstate.manager().subscribe(|entities: &EntityMap| {
        log::debug!("Home Assistant pushed {} entities", entities.len());
    });

    let agent = Arc::new(Agent::new(
        appstate.clone(),
        Arc::new(SensorSource),
        cancel.clone(),
    ));

    if let Err(err) = agent.bring_up().await {
        log::error!("Initial Home Assistant connection failed: {err}");
    }

    if mqtt_bootstrap {
        let bootstrap = agent.clone();
        tokio::spawn(async move {
            if let Err(err) = bootstrap.run_mqtt_bootstrap().await {
                log::warn!("MQTT bootstrap failed: {err}");
            }
        });
    }

    let watchdog = agent.clone();
    tokio::spawn(async move { watchdog.watchdog().await });

    let dispatcher = VisibilityDispatcher::from_config(&recovery, kind);
    log::debug!("Recovery policies: {:?}", dispatcher.policy_names());
    let handler: Arc<dyn RecoveryHandler> = agent.clone();
    tokio::spawn(dispatcher.run(visibility, handler));

    if intercom.enabled {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(IncomingCallListener::new(&intercom).run(tx, cancel.clone()));
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                log::info!(
                    "Intercom call {} from {} ({})",
                    call.id,
                    call.from,
                    call.livekit_url
                );
            }
        });
    }

    cancel.cancelled().await;
    appstate.manager().teardown().await;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        log::error!("Neolia error: {err}");
        log::error!("Fatal error encountered, cannot continue.");
    }
}

use actix_web::{App, HttpServer, dev::ServerHandle, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use std::{io::Write, sync::Arc};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use wifi_supervisor::{
    api::Api,
    command::SystemCommandRunner,
    config::AppConfig,
    services::{
        credentials::CredentialStore,
        network::{
            DEFAULT_QUEUE_DEPTH, HostapdDriver, NmClientDriver, Orchestrator, SystemProbe,
        },
    },
};

type SystemOrchestrator = Orchestrator<
    SystemProbe<SystemCommandRunner>,
    NmClientDriver<SystemCommandRunner>,
    HostapdDriver<SystemCommandRunner>,
>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::load().context("failed to load configuration")?;
    debug!("configuration: {config:?}");

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let store = Arc::new(CredentialStore::new(&config.paths.credential_store));
    let (orchestrator, mut supervisor_task) =
        build_orchestrator(&config, store.clone()).spawn(DEFAULT_QUEUE_DEPTH);

    let (server_handle, server_task) = run_server(&config, Api::new(orchestrator, store))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
        result = &mut supervisor_task => {
            match result {
                Ok(()) => error!("network supervisor stopped unexpectedly"),
                Err(e) => error!("network supervisor panicked: {e}"),
            }
        }
    }

    info!("shutting down");

    server_handle.stop(true).await;
    supervisor_task.abort();

    info!("shutdown complete");

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn build_orchestrator(config: &AppConfig, store: Arc<CredentialStore>) -> SystemOrchestrator {
    let runner = SystemCommandRunner::new(config.wifi.command_timeout);

    let probe = SystemProbe::new(
        runner.clone(),
        config.wifi.interface.clone(),
        config.dns.probe_host.clone(),
        config.reachability_probe(),
    );
    let client = NmClientDriver::new(runner.clone(), config.client_settings());
    let access_point = HostapdDriver::new(runner, config.access_point_settings());

    Orchestrator::new(
        probe,
        client,
        access_point,
        store,
        config.orchestrator_settings(),
    )
}

fn run_server(
    config: &AppConfig,
    api: Api,
) -> Result<(ServerHandle, JoinHandle<Result<(), std::io::Error>>)> {
    let ui_port = config.ui.port;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .configure(Api::configure)
    })
    .bind(format!("0.0.0.0:{ui_port}"))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    info!("listening on port {ui_port}");

    Ok((server.handle(), tokio::spawn(server)))
}

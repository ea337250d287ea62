use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use veille::bus::server::{self, BusServerState, ServerOptions};
use veille::bus::{BusClient, ClientOptions, Publisher, ReconnectConfig};
use veille::config::{CliArgs, Command, ExpireArgs, ServeArgs, Settings};
use veille::infra::telemetry;
use veille::store::{DurableTier, ResourceStore, StoreOptions};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let command = args
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    let mut settings = match Settings::load(args.config_file.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("veille: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = telemetry::init(&settings.logging) {
        eprintln!("veille: {err}");
        return ExitCode::FAILURE;
    }

    match command {
        Command::Serve(serve) => {
            settings.apply_serve_overrides(&serve);
            run_serve(settings).await
        }
        Command::Expire(expire) => run_expire(settings, expire).await,
    }
}

/// Run the hub: bus server (when configured), plus a store wired to its own
/// subscriber so this instance advances cascades like any other.
async fn run_serve(settings: Settings) -> ExitCode {
    let durable = match DurableTier::connect(
        &settings.store.durable_url,
        settings.store.max_connections,
    )
    .await
    {
        Ok(durable) => durable,
        Err(err) => {
            error!(url = %settings.store.durable_url, error = %err, "durable tier unavailable");
            return ExitCode::FAILURE;
        }
    };

    if let Some(listen) = &settings.bus.listen {
        let state = BusServerState::new(ServerOptions {
            token: settings.bus.token.clone(),
            backlog_limit: settings.bus.backlog_limit,
            channel_capacity: settings.bus.channel_capacity,
        });
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(listen, error = %err, "cannot bind bus listener");
                return ExitCode::FAILURE;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = server::serve(listener, state).await {
                error!(error = %err, "bus server exited");
            }
        });
    }

    let (publisher, outbound) = Publisher::channel();
    let store = ResourceStore::new(
        durable,
        publisher,
        StoreOptions {
            cache_size: settings.store.cache_size,
            ..Default::default()
        },
    );
    let _bus_state = BusClient::attach(
        store.clone(),
        ClientOptions {
            pool: settings.bus.pool.clone(),
            token: settings.bus.token.clone(),
            reconnect: ReconnectConfig::default(),
        },
        outbound,
    );

    info!("veille hub running; ctrl-c to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "signal handler failed");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    ExitCode::SUCCESS
}

/// One-shot garbage collection for a builder tag.
async fn run_expire(settings: Settings, args: ExpireArgs) -> ExitCode {
    let url = args
        .durable_url
        .unwrap_or(settings.store.durable_url.clone());
    let durable = match DurableTier::connect(&url, settings.store.max_connections).await {
        Ok(durable) => durable,
        Err(err) => {
            error!(url = %url, error = %err, "durable tier unavailable");
            return ExitCode::FAILURE;
        }
    };
    let (publisher, _outbound) = Publisher::channel();
    let store = ResourceStore::new(durable, publisher, StoreOptions::default());
    match store.expire(&args.builder).await {
        Ok(removed) => {
            info!(builder = %args.builder, removed, "expiry complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(builder = %args.builder, error = %err, "expiry failed");
            ExitCode::FAILURE
        }
    }
}

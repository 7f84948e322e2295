use std::sync::Arc;
use std::time::Duration;

use hub_client::{ConnectionState, HubClient, KnownEvent, Payload, SignalRTransport};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::processor;

/// Log in, connect, and run until SIGINT or SIGTERM.
pub async fn run(config: FeedConfig) -> FeedResult<()> {
    let auth = Arc::new(Authenticator::new(&config)?);
    info!("authenticating");
    let token = auth.login().await?;

    let transport = SignalRTransport::new()?.skip_negotiation(config.hub.skip_negotiation);
    let client = Arc::new(HubClient::new(
        config.hub_config(token),
        Arc::new(transport),
    ));
    register_handlers(&client);
    for sub in &config.subscriptions {
        client.subscribe(&sub.method, sub.hub_args())?;
    }
    let messages = client
        .messages()
        .ok_or_else(|| FeedError::Internal("message channel already taken".into()))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));
    let processor = tokio::spawn(processor::run(messages, shutdown.clone()));

    connect_with_fallback(&client, &auth, config.service.initial_retry_delay(), &shutdown)
        .await?;

    let stats = tokio::spawn(run_stats_monitor(
        client.clone(),
        config.service.stats_interval(),
        shutdown.clone(),
    ));
    let refresh = tokio::spawn(run_token_refresh(
        auth.clone(),
        client.clone(),
        config.service.token_refresh_interval(),
        shutdown.clone(),
    ));

    info!("datafeed running, press Ctrl+C to exit");
    shutdown.cancelled().await;

    info!("shutting down");
    client.close();
    for (name, handle) in [("stats monitor", stats), ("token refresh", refresh)] {
        if let Err(e) = handle.await {
            warn!("{name} task failed: {e}");
        }
    }
    match processor.await {
        Ok(processed) => info!(processed, "datafeed stopped"),
        Err(e) => warn!("message processor task failed: {e}"),
    }
    Ok(())
}

fn register_handlers(client: &HubClient) {
    client.register_custom_handler(KnownEvent::MARKET_STATUS_UPDATED, |msg| {
        let status = match &msg.data {
            Payload::Args(args) => args.first().map(hub_client::decoder::decode),
            Payload::Single(value) => Some(hub_client::decoder::decode(value)),
        };
        info!(method = %msg.method, ?status, "market status updated");
    });
    client.register_custom_handler("ConnectionEvent", |msg| {
        info!(data = ?msg.data, "connection event");
    });
    client.register_custom_handler("Error", |msg| {
        error!(data = ?msg.data, "server error");
    });
}

/// Connect once. If that fails, wait, log in again, and hand the fresh token
/// to the client; its background loop keeps retrying. A failed re-login is
/// fatal.
async fn connect_with_fallback(
    client: &HubClient,
    auth: &Authenticator,
    delay: Duration,
    shutdown: &CancellationToken,
) -> FeedResult<()> {
    info!("connecting to hub");
    let Err(e) = client.connect().await else {
        info!("hub connected");
        return Ok(());
    };

    warn!("hub connection failed: {e}");
    info!(delay_secs = delay.as_secs(), "retrying with a fresh token");
    tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        () = tokio::time::sleep(delay) => {}
    }

    let token = auth.login().await?;
    client.update_token(token)?;
    info!(status = %client.status(), "token renewed, reconnect continues in background");
    Ok(())
}

async fn run_stats_monitor(client: Arc<HubClient>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let stats = client.connection_stats();
        match stats.status {
            ConnectionState::Disconnected => {
                let last_error = client.last_error();
                warn!(
                    attempts = stats.reconnect_attempts,
                    subscriptions = stats.subscription_count,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "hub disconnected"
                );
            }
            status => {
                info!(
                    %status,
                    attempts = stats.reconnect_attempts,
                    subscriptions = stats.subscription_count,
                    dropped = stats.dropped_messages,
                    heartbeats = stats.heartbeats_received,
                    "hub status"
                );
            }
        }
    }
}

async fn run_token_refresh(
    auth: Arc<Authenticator>,
    client: Arc<HubClient>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        info!("refreshing authentication token");
        let result = tokio::select! {
            () = shutdown.cancelled() => break,
            result = auth.login() => result,
        };
        match result.and_then(|token| client.update_token(token).map_err(FeedError::from)) {
            Ok(()) => info!("token refreshed"),
            Err(e) => warn!("token refresh failed, retrying next interval: {e}"),
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT"),
        () = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

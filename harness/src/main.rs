// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signs in to a project, subscribes the user's realtime channels and lets
//! the operator simulate visibility changes from stdin.
//!
//! Commands: `hidden`, `visible`, `force`, `status`, `quit`.
//! Credentials are read from `MYGGV_EMAIL` and `MYGGV_PASSWORD`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use ggvapiclient::{ApiClient, realtime::RealtimeClient};
use ggvapplogic::{
    aggregator::ChannelAggregator,
    preferences::PreferencesStore,
    recovery::{RecoveryOptions, TabRecoveryCoordinator},
    registry::{ChannelRegistry, Topic},
    session::SessionKeeper,
    settings::get_configuration,
    visibility::{Visibility, VisibilityPublisher},
};
use ggvcommon::time::{self, TimeStamp};
use once_cell::sync::Lazy;
use serde_json::json;
use telemetry::{get_subscriber, init_subscriber};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod telemetry;

const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "info".to_string();
    let subscriber_name = "myggv-harness".to_string();
    let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
    if let Err(error) = init_subscriber(subscriber) {
        eprintln!("failed to init tracing: {error}");
    }
});

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Lazy::force(&TRACING);

    let settings = get_configuration(std::env::current_dir()?)?;
    let email = std::env::var("MYGGV_EMAIL").context("MYGGV_EMAIL is not set")?;
    let password = std::env::var("MYGGV_PASSWORD").context("MYGGV_PASSWORD is not set")?;

    let api = ApiClient::with_default_http_client(&settings.supabase.url, &settings.supabase.anon_key)?;
    let session = api.sign_in_with_password(&email, &password).await?;
    let user_id = session.user_id();
    info!(%user_id, "signed in");

    let preferences = PreferencesStore::load(&settings.preferences.path);
    let recovery_options = RecoveryOptions::from(&settings.recovery);
    info!(
        theme = ?preferences.theme(),
        offer_install = preferences.should_offer_install(recovery_options.display_mode, TimeStamp::now()),
        "preferences loaded"
    );

    let cancel = CancellationToken::new();
    let realtime = RealtimeClient::connect(
        &api.with_access_token(session.access_token.as_str()),
        (&settings.realtime).into(),
        cancel.clone(),
    )?;
    let registry = ChannelRegistry::new(realtime);

    let visibility = VisibilityPublisher::new(Visibility::Visible);
    let aggregator = Arc::new(ChannelAggregator::start(
        &registry,
        Topic::for_user(user_id),
        (&settings.connection).into(),
        settings.connection.stagger(),
        Some(json!({ "user_id": user_id, "online_at": TimeStamp::now() })),
        visibility.subscribe(),
    ));
    let keeper = Arc::new(SessionKeeper::new(api, session, registry.clone()));
    let recovery = TabRecoveryCoordinator::new(keeper.clone(), aggregator.clone(), recovery_options)
        .spawn(visibility.edges());

    tokio::spawn(log_reports(recovery.subscribe_reports(), cancel.clone()));
    tokio::spawn(log_events(registry.clone(), cancel.clone()));
    tokio::spawn(keep_session_fresh(keeper.clone(), cancel.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "hidden" => {
                visibility.set(Visibility::Hidden);
            }
            "visible" => {
                visibility.set(Visibility::Visible);
            }
            "force" => {
                let started = recovery.force_recovery().await;
                info!(started, "forced recovery");
            }
            "status" => {
                let status = aggregator.status();
                info!(
                    connected = status.connected,
                    total = status.total,
                    recovery = ?recovery.state(),
                    online = ?registry.presence().online_keys(),
                    "status"
                );
            }
            "quit" => break,
            "" => {}
            other => warn!(command = other, "unknown command"),
        }
    }

    recovery.close();
    aggregator.close();
    registry.close();
    if let Err(error) = keeper.sign_out().await {
        warn!(%error, "failed to sign out");
    }
    cancel.cancel();
    Ok(())
}

async fn log_reports(
    mut reports: watch::Receiver<Option<ggvapplogic::recovery::RecoveryReport>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = reports.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Some(report) = *reports.borrow_and_update() {
                    info!(?report, "recovery finished");
                }
            }
        }
    }
}

async fn log_events(registry: ChannelRegistry, cancel: CancellationToken) {
    let mut events = registry.events();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(event) => info!(topic = %event.topic, message = ?event.message, "event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn keep_session_fresh(keeper: Arc<SessionKeeper>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SESSION_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(error) = keeper
                    .refresh_if_expiring(TimeStamp::now(), time::Duration::minutes(5))
                    .await
                {
                    error!(%error, "failed to refresh session");
                }
            }
        }
    }
}

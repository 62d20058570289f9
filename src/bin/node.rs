//! League Node - 独立进程部署
//!
//! 一个进程扮演一个角色（league_manager / referee / player），通过 HTTP 互相调用。
//!
//! 运行方式：
//! ```bash
//! LEAGUE__NODE__ROLE=league_manager cargo run --bin league-node --features http-server
//! LEAGUE__NODE__ROLE=referee LEAGUE__NODE__BIND_ADDR=127.0.0.1:8100 cargo run --bin league-node --features http-server
//! LEAGUE__NODE__ROLE=player LEAGUE__NODE__BIND_ADDR=127.0.0.1:8201 cargo run --bin league-node --features http-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use league::config::{load_config, AppConfig};
use league::connection::ConnectionManager;
use league::core::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
use league::events::EventBus;
use league::game::GameRegistry;
use league::league::{LeagueManager, LeagueService, LeagueSettings, TournamentDriver};
use league::player::{PlayerAgent, PlayerSettings, StrategyRegistry};
use league::referee::{RefereeAgent, RefereeSettings};
use league::registry::{RegistryConfig, ServiceRegistry};
use league::transport::{serve, HttpTransport, LEAGUE_PATH};

struct Node {
    cfg: AppConfig,
    endpoint: String,
    listener: TcpListener,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    shutdown: Arc<ShutdownManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    league::observability::init();

    let cfg = load_config(std::env::args().nth(1).map(PathBuf::from)).context("Failed to load config")?;
    let transport = Arc::new(HttpTransport::new(Duration::from_millis(cfg.resilience.call_timeout_ms))?);
    let connection = Arc::new(ConnectionManager::new(transport, &cfg.resilience));
    let listener = TcpListener::bind(&cfg.node.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.node.bind_addr))?;
    let endpoint = cfg
        .node
        .public_endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}{}", cfg.node.bind_addr, LEAGUE_PATH));

    let node = Node {
        events: EventBus::new(cfg.events.history_capacity),
        cfg,
        endpoint,
        listener,
        connection,
        shutdown: Arc::new(ShutdownManager::new()),
    };
    info!(role = %node.cfg.node.role, endpoint = %node.endpoint, "Starting league node");

    match node.cfg.node.role.as_str() {
        "league_manager" => run_league_manager(node).await,
        "referee" => run_referee(node).await,
        "player" => run_player(node).await,
        other => anyhow::bail!("unknown node role: {other}"),
    }
}

async fn run_league_manager(node: Node) -> anyhow::Result<()> {
    let Node {
        cfg,
        listener,
        connection,
        events,
        shutdown,
        ..
    } = node;

    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::from_config(&cfg.registry)));
    registry.spawn_sweeper(
        Duration::from_secs(cfg.registry.sweep_interval_secs),
        shutdown.child_token(),
    );
    let manager = Arc::new(LeagueManager::new(
        LeagueSettings::from_config(&cfg.league),
        registry,
        connection,
        events.clone(),
    ));
    let server = tokio::spawn(serve(
        listener,
        Arc::new(LeagueService::new(manager.clone())),
        shutdown.child_token(),
    ));

    let driver = TournamentDriver::new(manager.clone(), &cfg.league);
    let expected = cfg.node.expected_players;
    let token = shutdown.child_token();
    let app = async move {
        if !wait_for_players(&manager, expected, &token).await {
            return;
        }
        match driver.run(token).await {
            Ok(standings) => {
                for row in standings {
                    info!(rank = row.rank, player_id = %row.player_id, points = row.points, flagged = row.flagged, "Final standing");
                }
            }
            Err(e) => error!("Tournament aborted: {}", e),
        }
    };

    let cleanup_shutdown = Arc::clone(&shutdown);
    run_with_graceful_shutdown(shutdown, app, || async move {
        cleanup_shutdown.shutdown(ShutdownReason::LeagueComplete);
        if let Ok(Err(e)) = server.await {
            error!("Server error: {}", e);
        }
        events.flush().await;
    })
    .await;
    Ok(())
}

/// 等到注册人数达到 expected 再开赛
async fn wait_for_players(manager: &LeagueManager, expected: usize, token: &CancellationToken) -> bool {
    loop {
        manager.prune_expired().await;
        let registered = manager.players().await.len();
        if registered >= expected {
            info!(registered, "Enough players registered, starting league");
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

async fn run_referee(node: Node) -> anyhow::Result<()> {
    let Node {
        cfg,
        endpoint,
        listener,
        connection,
        events,
        shutdown,
    } = node;

    let referee = RefereeAgent::new(
        RefereeSettings {
            display_name: cfg.node.display_name.clone(),
            ..RefereeSettings::from_config(&cfg.league.league_id, &endpoint, &cfg.referee)
        },
        GameRegistry::with_builtin(),
        connection,
        events.clone(),
    );
    let server = tokio::spawn(serve(listener, referee.clone(), shutdown.child_token()));

    referee
        .register(&cfg.node.league_endpoint)
        .await
        .context("Referee registration failed")?;
    let interval = Duration::from_secs(cfg.registry.heartbeat_interval_secs);
    referee.spawn_heartbeat(interval, shutdown.child_token());

    // 定期重新上报失败的结果
    let reconciler = {
        let referee = referee.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !referee.pending_reconciliation().is_empty() {
                            let delivered = referee.reconcile().await;
                            info!(delivered, "Reconciliation pass finished");
                        }
                    }
                }
            }
        })
    };

    let cleanup_shutdown = Arc::clone(&shutdown);
    run_with_graceful_shutdown(shutdown, std::future::pending::<()>(), || async move {
        referee.shutdown().await;
        cleanup_shutdown.shutdown(ShutdownReason::Signal);
        let _ = reconciler.await;
        if let Ok(Err(e)) = server.await {
            error!("Server error: {}", e);
        }
        events.flush().await;
    })
    .await;
    Ok(())
}

async fn run_player(node: Node) -> anyhow::Result<()> {
    let Node {
        cfg,
        endpoint,
        listener,
        connection,
        shutdown,
        ..
    } = node;

    let strategy = StrategyRegistry::with_builtin().resolve(&cfg.node.strategy)?;
    let player = Arc::new(PlayerAgent::new(
        PlayerSettings {
            league_id: cfg.league.league_id.clone(),
            endpoint,
            display_name: cfg.node.display_name.clone(),
            games: vec![cfg.league.game.clone()],
        },
        strategy,
        connection,
    ));
    let server = tokio::spawn(serve(listener, player.clone(), shutdown.child_token()));

    player
        .register(&cfg.node.league_endpoint)
        .await
        .context("Player registration failed")?;
    player.spawn_heartbeat(
        &cfg.node.league_endpoint,
        Duration::from_secs(cfg.registry.heartbeat_interval_secs),
        shutdown.child_token(),
    );

    let cleanup_shutdown = Arc::clone(&shutdown);
    run_with_graceful_shutdown(shutdown, std::future::pending::<()>(), || async move {
        cleanup_shutdown.shutdown(ShutdownReason::Signal);
        if let Ok(Err(e)) = server.await {
            error!("Server error: {}", e);
        }
        if let Some(update) = player.last_standings() {
            info!(round = update.round_id, "Last standings received before shutdown");
        }
    })
    .await;
    Ok(())
}

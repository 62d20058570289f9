//! League - 进程内循环赛
//!
//! 入口：加载配置、在进程内传输上拉起 League Manager、裁判与玩家，跑完一届循环赛并打印积分榜。
//! 独立进程部署见 `league-node`。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use league::config::load_config;
use league::connection::ConnectionManager;
use league::core::{ShutdownManager, ShutdownReason};
use league::events::{handler_fn, EventBus};
use league::game::GameRegistry;
use league::league::{LeagueManager, LeagueService, LeagueSettings, StandingRow, TournamentDriver};
use league::player::{PlayerAgent, PlayerSettings, StrategyRegistry};
use league::referee::{RefereeAgent, RefereeSettings};
use league::registry::{RegistryConfig, ServiceRegistry};
use league::transport::InMemoryTransport;

const LEAGUE_ENDPOINT: &str = "mem://league";
const REFEREES: usize = 2;
const STRATEGIES: [&str; 4] = ["random", "fixed:3", "cycle", "random:2-4"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    league::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let transport = Arc::new(InMemoryTransport::new());
    let connection = Arc::new(ConnectionManager::new(transport.clone(), &cfg.resilience));
    let events = EventBus::new(cfg.events.history_capacity);
    events.subscribe(
        "league.*",
        handler_fn(|event| async move {
            tracing::info!(event_type = %event.event_type, "League event");
            anyhow::Ok(())
        }),
    );

    let registry = Arc::new(ServiceRegistry::new(RegistryConfig::from_config(&cfg.registry)));
    let sweeper = registry.spawn_sweeper(
        Duration::from_secs(cfg.registry.sweep_interval_secs),
        shutdown.child_token(),
    );

    let manager = Arc::new(LeagueManager::new(
        LeagueSettings::from_config(&cfg.league),
        registry,
        connection.clone(),
        events.clone(),
    ));
    transport.bind(LEAGUE_ENDPOINT, Arc::new(LeagueService::new(manager.clone())));

    let heartbeat_interval = Duration::from_secs(cfg.registry.heartbeat_interval_secs);
    let mut referees = Vec::with_capacity(REFEREES);
    for i in 1..=REFEREES {
        let endpoint = format!("mem://referee-{i}");
        let referee = RefereeAgent::new(
            RefereeSettings::from_config(&cfg.league.league_id, &endpoint, &cfg.referee),
            GameRegistry::with_builtin(),
            connection.clone(),
            events.clone(),
        );
        transport.bind(endpoint, referee.clone());
        referee
            .register(LEAGUE_ENDPOINT)
            .await
            .context("Referee registration failed")?;
        referee.spawn_heartbeat(heartbeat_interval, shutdown.child_token());
        referees.push(referee);
    }

    let strategies = StrategyRegistry::with_builtin();
    for (i, spec) in STRATEGIES.iter().enumerate() {
        let endpoint = format!("mem://player-{}", i + 1);
        let player = Arc::new(PlayerAgent::new(
            PlayerSettings {
                league_id: cfg.league.league_id.clone(),
                endpoint: endpoint.clone(),
                display_name: Some(format!("{spec} bot")),
                games: vec![cfg.league.game.clone()],
            },
            strategies.resolve(spec)?,
            connection.clone(),
        ));
        transport.bind(endpoint, player.clone());
        player
            .register(LEAGUE_ENDPOINT)
            .await
            .context("Player registration failed")?;
        player.spawn_heartbeat(LEAGUE_ENDPOINT, heartbeat_interval, shutdown.child_token());
    }

    let driver = TournamentDriver::new(manager.clone(), &cfg.league);
    let outcome = driver.run(shutdown.child_token()).await;

    shutdown.shutdown(match &outcome {
        Ok(_) => ShutdownReason::LeagueComplete,
        Err(e) => ShutdownReason::FatalError(e.to_string()),
    });
    for referee in &referees {
        referee.shutdown().await;
    }
    let _ = sweeper.await;
    events.flush().await;

    let standings = outcome.context("Tournament aborted")?;
    print_standings(manager.league_id(), &standings);
    Ok(())
}

fn print_standings(league_id: &str, standings: &[StandingRow]) {
    println!("\nFinal standings for {league_id}");
    println!("{:<5}{:<8}{:>4}{:>4}{:>4}{:>4}{:>6}", "Rank", "Player", "P", "W", "D", "L", "Pts");
    for row in standings {
        let flag = if row.flagged > 0 { " *" } else { "" };
        println!(
            "{:<5}{:<8}{:>4}{:>4}{:>4}{:>4}{:>6}{}",
            row.rank, row.player_id, row.played, row.wins, row.draws, row.losses, row.points, flag
        );
    }
}

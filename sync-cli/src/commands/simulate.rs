//! Pair a desk and a phone over an in-process network.

use anyhow::{Context, Result};
use cardsync_peer::{
    CardRecord, ChangeType, MemoryNetwork, MemoryStore, NodeConfig, NodeEvent, PeerNode, Role,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

/// Outcome of one simulated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Cards the phone created offline.
    pub created: usize,
    /// Cards that reached the desk.
    pub received: usize,
    /// Cards the phone has marked synced.
    pub synced: usize,
    /// Sync failures reported on either side.
    pub failures: usize,
    /// Time from starting both nodes to the last card landing.
    pub elapsed: Duration,
}

/// Run the simulate command.
pub async fn run(config: Option<&Path>, cards: usize, timeout_secs: u64) -> Result<()> {
    let base = super::load_config(config)?;
    let report = simulate(base, cards, Duration::from_secs(timeout_secs)).await?;

    println!("=== cardsync simulate ===");
    println!();
    println!("  Created:  {}", report.created);
    println!("  Received: {}", report.received);
    println!("  Synced:   {}", report.synced);
    println!("  Failures: {}", report.failures);
    println!("  Elapsed:  {:?}", report.elapsed);

    if report.received < report.created {
        anyhow::bail!(
            "only {} of {} cards arrived within {}s",
            report.received,
            report.created,
            timeout_secs
        );
    }
    Ok(())
}

/// Create `cards` on an offline phone, bring up both devices and wait until
/// the desk holds them all or `timeout` passes.
pub async fn simulate(base: NodeConfig, cards: usize, timeout: Duration) -> Result<Report> {
    let network = MemoryNetwork::new();
    let desk = PeerNode::new(
        base.clone().with_device_name("Desk").with_role(Role::Server),
        Arc::new(network.clone()),
    )
    .context("Failed to create desk node")?;
    let phone = PeerNode::new(
        base.with_device_name("Phone").with_role(Role::Client),
        Arc::new(network.clone()),
    )
    .context("Failed to create phone node")?;

    let desk_store = MemoryStore::new();
    let phone_store = MemoryStore::new();
    desk.set_active_store(Arc::new(desk_store.clone()));
    phone.set_active_store(Arc::new(phone_store.clone()));

    for i in 0..cards {
        let card = CardRecord::new(format!("card {}", i + 1));
        phone.save_card(card, ChangeType::Created).await?;
    }
    tracing::info!(cards, "Phone queued cards while offline");

    let mut desk_events = desk.subscribe();
    let mut phone_events = phone.subscribe();

    let started = Instant::now();
    desk.start().await.context("Failed to start desk")?;
    phone.start().await.context("Failed to start phone")?;

    let deadline = started + timeout;
    while desk_store.cards().len() < cards && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();

    // Let the sender mark the last batch synced.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut failures = 0;
    for rx in [&mut desk_events, &mut phone_events] {
        loop {
            match rx.try_recv() {
                Ok(NodeEvent::SyncCompleted {
                    success: false,
                    error,
                }) => {
                    tracing::warn!(?error, "Sync failed");
                    failures += 1;
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    let report = Report {
        created: cards,
        received: desk_store.cards().len(),
        synced: phone_store.cards().iter().filter(|c| c.is_synced).count(),
        failures,
        elapsed,
    };

    phone.stop().await;
    desk.stop().await;
    Ok(report)
}

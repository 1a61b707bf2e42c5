//! Background ticker. One loop, one-minute cadence, each sub-task isolated
//! so a failing tick never kills the scheduler.
//!
//! | cadence (ticks) | task |
//! |---|---|
//! | 1 | ingestion scan, tamper check |
//! | 10 | config sync (push on change or drift) |
//! | 15 | group-membership refresh (business mode only) |
//! | 60 | nonce cleanup |
//! | 1440 | weekly HMAC rotation check |

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use aide_core::config::EXIT_TAMPER;
use aide_core::types::now_ms;
use aide_ingest::IngestSettings;

use crate::app::AppState;
use crate::rotation;

pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::time::sleep(std::time::Duration::from_secs(
        state.config.scheduler.startup_delay_secs,
    ))
    .await;

    let ingest_settings = ingest_settings(&state);

    info!(tick_secs = state.config.scheduler.tick_secs, "scheduler started");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.config.scheduler.tick_secs));
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick += 1;
                run_tick(&state, &ingest_settings, tick).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_tick(state: &Arc<AppState>, ingest: &IngestSettings, tick: u64) {
    // Every tick: ingest pending knowledge files.
    let (files, chunks) = aide_ingest::process_pending(&state.store, ingest);
    if files > 0 {
        info!(files, chunks, "auto-ingestion processed files");
    }

    // Every tick: tamper check. A deviation is fatal.
    let findings = state.tamper.check();
    if !findings.is_empty() {
        for finding in &findings {
            error!(%finding, "CONFIG TAMPERING DETECTED");
        }
        std::process::exit(EXIT_TAMPER);
    }

    if tick % 60 == 0 {
        let removed = state.nonces.cleanup(now_ms());
        if removed > 0 {
            info!(removed, "expired nonces cleaned up");
        }
    }

    if tick % 10 == 0 {
        if let Err(e) = config_sync(state).await {
            warn!(error = %e, "config sync failed, retrying next cycle");
        }
    }

    if tick % 15 == 0 && state.policy.is_business_mode() && state.policy.dm_group_knowledge_enabled()
    {
        refresh_membership(state);
    }

    if tick % 1440 == 0 {
        let due = state.rotation.lock().unwrap().is_due(now_ms());
        if due {
            info!("weekly HMAC rotation due");
            if let Err(e) = rotation::rotate(state, true).await {
                warn!(error = %e, "scheduled rotation failed");
            }
        }
    }
}

/// Push the policy when the local hash changed since the last push, or
/// when the mesh reports a different hash (or none, after a mesh restart).
pub async fn config_sync(state: &Arc<AppState>) -> Result<bool, String> {
    let local_hash = state.policy.hash();
    let last_push = state.sync.lock().unwrap().clone();

    let needs_push = if last_push.last_push_hash.as_deref() != Some(local_hash.as_str()) {
        true
    } else {
        match state.mesh.fetch_status(&state.secrets).await {
            Ok(Some(mesh_hash)) => {
                if mesh_hash != local_hash {
                    warn!(%mesh_hash, %local_hash, "mesh config drift detected");
                    true
                } else {
                    false
                }
            }
            Ok(None) => {
                info!("mesh reports no config, forcing push");
                true
            }
            Err(e) => return Err(format!("mesh_unreachable: {e}")),
        }
    };

    if !needs_push {
        return Ok(false);
    }

    let payload = state.policy.config_for_push(now_ms());
    let pushed_hash = state
        .mesh
        .push_config(&payload, &state.secrets)
        .await
        .map_err(|e| e.to_string())?;

    if pushed_hash != local_hash {
        warn!(%pushed_hash, %local_hash, "mesh computed a different hash after push");
    }
    let mut sync = state.sync.lock().unwrap();
    sync.last_push_hash = Some(pushed_hash);
    sync.last_push_ms = now_ms();
    info!("policy pushed to mesh");
    Ok(true)
}

/// Rebuild the membership cache from the policy's group table. Each
/// participant may be listed under several transport identifiers; all of
/// them index the member.
fn refresh_membership(state: &Arc<AppState>) {
    let policy = state.policy.config();
    for (group_id, group) in &policy.identity.groups {
        state
            .membership
            .update_group(group_id, group.participants.iter().cloned());
    }
    state.membership.mark_refreshed(now_ms());
}

fn ingest_settings(state: &Arc<AppState>) -> IngestSettings {
    let mut settings = IngestSettings::new(&state.config.ingestion.dir);
    settings.keep_files = state.config.ingestion.keep_files;
    settings.chunk_size = state.config.ingestion.chunk_size;
    settings.overlap = state.config.ingestion.overlap;
    settings.max_file_bytes = state.config.ingestion.max_file_bytes;
    settings
}

//! Scheduler watchdog.
//!
//! Runs due schedules through the same post-message pipeline as
//! interactive chat. Exclusivity across workers rests entirely on the
//! store lease: claim with TTL, renew at `ttl/3` while the turn runs,
//! release with the run outcome. In-process concurrency is capped; one
//! schedule's failure never touches another.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use agently_domain::error::Result;
use agently_domain::model::{Schedule, Trigger, TurnStatus};

use crate::runtime::turn::{self, PostMessageRequest};
use crate::state::AppState;

/// Schedules claimed per tick.
const BATCH_LIMIT: usize = 16;

/// In-process concurrent schedule runs.
const MAX_CONCURRENT_RUNS: usize = 4;

pub struct Watchdog {
    state: AppState,
    owner: String,
    lease_ttl: chrono::Duration,
    slots: Arc<Semaphore>,
}

impl Watchdog {
    pub fn new(state: AppState) -> Self {
        let owner = state
            .config
            .scheduler
            .owner
            .clone()
            .unwrap_or_else(|| format!("agently-{}", Uuid::new_v4()));
        let lease_ttl = chrono::Duration::seconds(state.config.scheduler.lease_ttl_sec as i64);
        Self {
            state,
            owner,
            lease_ttl,
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run the watchdog. With `once` it processes a single batch and
    /// returns; otherwise it loops on `interval` forever.
    pub async fn run(&self, once: bool, interval: Duration) -> Result<()> {
        tracing::info!(owner = %self.owner, once, "scheduler watchdog starting");
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
            if once {
                // Let in-flight runs finish before returning.
                let _all = self
                    .slots
                    .acquire_many(MAX_CONCURRENT_RUNS as u32)
                    .await
                    .map_err(|_| agently_domain::error::Error::Other("slots closed".into()))?;
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Claim due schedules and spawn a bounded run for each.
    pub async fn tick(&self) -> Result<()> {
        let due = self.state.store.claim_due_schedules(
            &self.owner,
            self.lease_ttl,
            Utc::now(),
            BATCH_LIMIT,
        )?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(claimed = due.len(), "scheduler claimed due schedules");

        for schedule in due {
            let permit = match self.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let state = self.state.clone();
            let owner = self.owner.clone();
            let lease_ttl = self.lease_ttl;
            let span = tracing::info_span!(
                "schedule.run",
                schedule_id = %schedule.id,
                name = %schedule.name,
            );
            tokio::spawn(
                async move {
                    let _permit = permit;
                    run_schedule(state, schedule, owner, lease_ttl).await;
                }
                .instrument(span),
            );
        }
        Ok(())
    }
}

/// Execute one claimed schedule: keep the lease fresh, run the turn,
/// record the outcome.
async fn run_schedule(
    state: AppState,
    schedule: Schedule,
    owner: String,
    lease_ttl: chrono::Duration,
) {
    let schedule_id = schedule.id;

    // Renew the lease at ttl/3 while the run is in flight.
    let renewer = {
        let state = state.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs((lease_ttl.num_seconds().max(3) as u64) / 3);
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match state.store.renew_lease(schedule_id, &owner, lease_ttl, Utc::now()) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(schedule_id = %schedule_id, "lease lost during run");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lease renewal failed");
                        break;
                    }
                }
            }
        })
    };

    let status = match execute_scheduled_turn(&state, &schedule).await {
        Ok(status) => status.as_str().to_string(),
        Err(e) => {
            tracing::warn!(schedule_id = %schedule_id, error = %e, "scheduled run failed");
            format!("failed: {e}")
        }
    };
    renewer.abort();

    let next_due = match schedule.trigger {
        Trigger::Every { interval_sec } => {
            Some(Utc::now() + chrono::Duration::seconds(interval_sec as i64))
        }
        Trigger::At { .. } => None,
    };
    if let Err(e) = state
        .store
        .finish_schedule_run(schedule_id, &owner, &status, next_due)
    {
        tracing::warn!(schedule_id = %schedule_id, error = %e, "failed to record run outcome");
    }
    tracing::info!(schedule_id = %schedule_id, status = %status, "scheduled run finished");
}

async fn execute_scheduled_turn(state: &AppState, schedule: &Schedule) -> Result<TurnStatus> {
    // Reuse the template conversation or mint a fresh one per run.
    let conversation_id = match schedule.conversation_id {
        Some(id) if state.store.get_conversation(id)?.is_some() => id,
        _ => {
            state
                .store
                .create_conversation(&schedule.user_subject, None)?
                .id
        }
    };

    let (turn_id, _message_id) = turn::post_message(
        state,
        PostMessageRequest {
            conversation_id,
            content: schedule.content.clone(),
            agent: schedule.agent_id.clone(),
            model: schedule.model_id.clone(),
            context: Map::new(),
            attachments: Vec::new(),
            user_subject: schedule.user_subject.clone(),
            bearer: None,
        },
    )
    .await?;

    let timeout = Duration::from_secs(state.config.orchestrator.turn_timeout_sec + 30);
    let turn = turn::wait_for_turn(state, conversation_id, turn_id, timeout).await?;
    Ok(turn.status)
}

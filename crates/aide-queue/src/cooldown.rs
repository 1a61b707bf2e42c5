use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Per-conversation minimum inter-send delay.
///
/// Each conversation gets its own async mutex, so at most one send is in
/// flight per conversation; the next sender sleeps whatever remains of the
/// cooldown before proceeding.
pub struct SendCooldown {
    dm_cooldown: Duration,
    group_cooldown: Duration,
    slots: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl SendCooldown {
    pub fn new(dm_cooldown_ms: u64, group_cooldown_ms: u64) -> Self {
        Self {
            dm_cooldown: Duration::from_millis(dm_cooldown_ms),
            group_cooldown: Duration::from_millis(group_cooldown_ms),
            slots: DashMap::new(),
        }
    }

    /// Run `send` after the conversation's cooldown has elapsed, holding the
    /// conversation's send slot for the duration.
    pub async fn pace<F, T>(&self, conversation_id: &str, is_group: bool, send: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = self
            .slots
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let cooldown = if is_group {
            self.group_cooldown
        } else {
            self.dm_cooldown
        };

        let mut last_send = slot.lock().await;
        if let Some(last) = *last_send {
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                let wait = cooldown - elapsed;
                debug!(conversation_id, wait_ms = wait.as_millis() as u64, "cooldown wait");
                tokio::time::sleep(wait).await;
            }
        }
        let result = send.await;
        *last_send = Some(Instant::now());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_send_waits_out_the_cooldown() {
        let cooldown = SendCooldown::new(5_000, 2_000);
        let start = Instant::now();

        cooldown.pace("+1", false, async {}).await;
        cooldown.pace("+1", false, async {}).await;

        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn groups_use_the_shorter_cooldown() {
        let cooldown = SendCooldown::new(5_000, 2_000);
        let start = Instant::now();

        cooldown.pace("group-1", true, async {}).await;
        cooldown.pace("group-1", true, async {}).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_000));
        assert!(elapsed < Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_do_not_block_each_other() {
        let cooldown = SendCooldown::new(5_000, 2_000);
        cooldown.pace("+1", false, async {}).await;

        let start = Instant::now();
        cooldown.pace("+2", false, async {}).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_within_one_conversation_serialize() {
        let cooldown = Arc::new(SendCooldown::new(1_000, 1_000));
        let running = Arc::new(std::sync::Mutex::new(0u32));
        let max_seen = Arc::new(std::sync::Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cooldown = cooldown.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                cooldown
                    .pace("+1", false, async {
                        {
                            let mut r = running.lock().unwrap();
                            *r += 1;
                            let mut m = max_seen.lock().unwrap();
                            *m = (*m).max(*r);
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        *running.lock().unwrap() -= 1;
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*max_seen.lock().unwrap(), 1);
    }
}

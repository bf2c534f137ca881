//! In-process event bus with NATS-style subject wildcards.

use async_trait::async_trait;
use futures::stream;
use girder_core::events::Event;
use girder_core::ports::{EventBus, EventStream};
use girder_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_LOG_LIMIT: usize = 10_000;

/// Event bus backed by a tokio broadcast channel.
///
/// Keeps a copy of the most recent published events so embedders can
/// inspect what happened without subscribing up front. Older events fall
/// off once the log reaches its limit.
#[derive(Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
    log: Arc<Mutex<VecDeque<Event>>>,
    log_limit: usize,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            log: Arc::new(Mutex::new(VecDeque::new())),
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }

    /// Keep at most `limit` events in the published log.
    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    /// The retained published events, oldest first.
    pub async fn published(&self) -> Vec<Event> {
        self.log.lock().await.iter().cloned().collect()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Match a dotted subject against a pattern where `*` matches one token
/// and a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!("Publishing event to {}", event.subject());
        {
            let mut log = self.log.lock().await;
            if log.len() >= self.log_limit {
                log.pop_front();
            }
            if self.log_limit > 0 {
                log.push_back(event.clone());
            }
        }
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        if pattern.is_empty() {
            return Err(Error::EventBus("Empty subject pattern".to_string()));
        }
        debug!("Subscribing to pattern: {}", pattern);

        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let events = stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if subject_matches(&pattern, &event.subject()) => {
                        return Some((Ok(event), (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, pattern = %pattern, "Subscriber lagged");
                        let err = Error::EventBus(format!(
                            "Subscriber lagged, {} events skipped",
                            skipped
                        ));
                        return Some((Err(err), (rx, pattern)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}

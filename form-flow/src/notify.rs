use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::{
    error::Result,
    event::{OwnerId, Prompt},
};

/// Delivers prompts back to the owner through whatever transport is in front
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, owner: OwnerId, prompt: &Prompt) -> Result<()>;
}

/// Queues prompts per owner until the transport drains them.
///
/// Each queue keeps at most `capacity` prompts; older ones are dropped first.
#[derive(Clone)]
pub struct InMemoryOutbox {
    queues: Arc<DashMap<OwnerId, VecDeque<Prompt>>>,
    capacity: usize,
}

impl InMemoryOutbox {
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Takes every queued prompt for `owner`, oldest first
    pub fn drain(&self, owner: OwnerId) -> Vec<Prompt> {
        self.queues
            .remove(&owner)
            .map(|(_, prompts)| Vec::from(prompts))
            .unwrap_or_default()
    }

    pub fn pending(&self, owner: OwnerId) -> usize {
        self.queues.get(&owner).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for InMemoryOutbox {
    async fn notify(&self, owner: OwnerId, prompt: &Prompt) -> Result<()> {
        let mut queue = self.queues.entry(owner).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(prompt.clone());
        Ok(())
    }
}

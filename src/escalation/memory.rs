use super::{EscalationItem, EscalationQueue, EscalationStatus, QueueError};
use crate::types::EscalationId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local queue. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryEscalationQueue {
    items: RwLock<BTreeMap<EscalationId, EscalationItem>>,
}

impl InMemoryEscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl EscalationQueue for InMemoryEscalationQueue {
    async fn append(&self, item: EscalationItem) -> Result<EscalationId, QueueError> {
        let id = item.id;
        self.items.write().entry(id).or_insert(item);
        Ok(id)
    }

    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationItem>, QueueError> {
        let mut items: Vec<EscalationItem> = self
            .items
            .read()
            .values()
            .filter(|item| status.is_none_or(|s| s == item.status))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get(&self, id: EscalationId) -> Result<EscalationItem, QueueError> {
        self.items
            .read()
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }

    async fn transition(
        &self,
        id: EscalationId,
        next: EscalationStatus,
        note: Option<String>,
    ) -> Result<EscalationItem, QueueError> {
        let mut items = self.items.write();
        let item = items.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        item.apply_transition(next, note)?;
        Ok(item.clone())
    }
}

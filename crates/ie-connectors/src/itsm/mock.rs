//! Mock ticket system for testing.

use crate::traits::{
    Connector, ConnectorCategory, ConnectorError, ConnectorHealth, ConnectorResult, Ticket,
    TicketNote, TicketSystemConnector,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Mock ticket system keeping tickets, notes, annotations and CI links in memory.
pub struct MockTicketSystem {
    name: String,
    tickets: Arc<RwLock<HashMap<String, Ticket>>>,
    notes: Arc<RwLock<HashMap<String, Vec<TicketNote>>>>,
    annotations: Arc<RwLock<Vec<(String, String)>>>,
    links: Arc<RwLock<Vec<(String, String)>>>,
    fail_fetch: Arc<RwLock<Option<ConnectorError>>>,
    fail_link: Arc<RwLock<bool>>,
    fetch_calls: AtomicUsize,
}

impl MockTicketSystem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tickets: Arc::new(RwLock::new(HashMap::new())),
            notes: Arc::new(RwLock::new(HashMap::new())),
            annotations: Arc::new(RwLock::new(Vec::new())),
            links: Arc::new(RwLock::new(Vec::new())),
            fail_fetch: Arc::new(RwLock::new(None)),
            fail_link: Arc::new(RwLock::new(false)),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Adds or replaces a ticket.
    pub async fn add_ticket(&self, ticket: Ticket) {
        self.tickets.write().await.insert(ticket.id.clone(), ticket);
    }

    /// Removes a ticket so that lookups return `None`.
    pub async fn remove_ticket(&self, ticket_id: &str) {
        self.tickets.write().await.remove(ticket_id);
    }

    /// Adds a note to a ticket.
    pub async fn add_note(&self, ticket_id: &str, note: TicketNote) {
        self.notes
            .write()
            .await
            .entry(ticket_id.to_string())
            .or_default()
            .push(note);
    }

    /// Makes `get_ticket` and `get_notes` fail with `error` (or succeed again with `None`).
    pub async fn set_fetch_failure(&self, error: Option<ConnectorError>) {
        *self.fail_fetch.write().await = error;
    }

    /// Makes `link_configuration_item` fail.
    pub async fn set_link_failure(&self, fail: bool) {
        *self.fail_link.write().await = fail;
    }

    /// Annotations written so far as `(ticket_id, text)`.
    pub async fn annotations(&self) -> Vec<(String, String)> {
        self.annotations.read().await.clone()
    }

    /// Annotations written for one ticket.
    pub async fn annotations_for(&self, ticket_id: &str) -> Vec<String> {
        self.annotations
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == ticket_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// CI links written so far as `(ticket_id, ci_id)`.
    pub async fn links(&self) -> Vec<(String, String)> {
        self.links.read().await.clone()
    }

    /// Number of `get_ticket` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockTicketSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "itsm"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::Itsm
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl TicketSystemConnector for MockTicketSystem {
    async fn get_ticket(&self, ticket_id: &str) -> ConnectorResult<Option<Ticket>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_fetch.read().await.clone() {
            return Err(err);
        }
        Ok(self.tickets.read().await.get(ticket_id).cloned())
    }

    async fn get_notes(&self, ticket_id: &str, limit: usize) -> ConnectorResult<Vec<TicketNote>> {
        if let Some(err) = self.fail_fetch.read().await.clone() {
            return Err(err);
        }
        let mut notes = self
            .notes
            .read()
            .await
            .get(ticket_id)
            .cloned()
            .unwrap_or_default();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notes.truncate(limit);
        Ok(notes)
    }

    async fn annotate(&self, ticket_id: &str, text: &str) -> ConnectorResult<()> {
        if !self.tickets.read().await.contains_key(ticket_id) {
            return Err(ConnectorError::NotFound(format!(
                "Ticket not found: {}",
                ticket_id
            )));
        }
        self.annotations
            .write()
            .await
            .push((ticket_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn link_configuration_item(&self, ticket_id: &str, ci_id: &str) -> ConnectorResult<()> {
        if *self.fail_link.read().await {
            return Err(ConnectorError::RequestFailed("Simulated link failure".into()));
        }
        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .get_mut(ticket_id)
            .ok_or_else(|| ConnectorError::NotFound(format!("Ticket not found: {}", ticket_id)))?;
        ticket.configuration_item = Some(ci_id.to_string());
        self.links
            .write()
            .await
            .push((ticket_id.to_string(), ci_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_note, sample_ticket};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_notes_are_newest_first_and_limited() {
        let mock = MockTicketSystem::new("tickets");
        mock.add_ticket(sample_ticket("T1", "Email down")).await;
        let now = Utc::now();
        mock.add_note("T1", sample_note("first", now - Duration::hours(2)))
            .await;
        mock.add_note("T1", sample_note("third", now)).await;
        mock.add_note("T1", sample_note("second", now - Duration::hours(1)))
            .await;

        let notes = mock.get_notes("T1", 2).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].text, "third");
        assert_eq!(notes[1].text, "second");
    }

    #[tokio::test]
    async fn test_missing_ticket_returns_none() {
        let mock = MockTicketSystem::new("tickets");
        assert!(mock.get_ticket("nope").await.unwrap().is_none());
        assert_eq!(mock.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_link_updates_ticket_and_records() {
        let mock = MockTicketSystem::new("tickets");
        mock.add_ticket(sample_ticket("T1", "Disk full")).await;
        mock.link_configuration_item("T1", "ci-9").await.unwrap();

        let ticket = mock.get_ticket("T1").await.unwrap().unwrap();
        assert_eq!(ticket.configuration_item.as_deref(), Some("ci-9"));
        assert_eq!(mock.links().await, vec![("T1".into(), "ci-9".into())]);

        mock.set_link_failure(true).await;
        assert!(mock.link_configuration_item("T1", "ci-10").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_failure_injection() {
        let mock = MockTicketSystem::new("tickets");
        mock.add_ticket(sample_ticket("T1", "Disk full")).await;
        mock.set_fetch_failure(Some(ConnectorError::Timeout("slow".into())))
            .await;
        assert!(matches!(
            mock.get_ticket("T1").await,
            Err(ConnectorError::Timeout(_))
        ));
        mock.set_fetch_failure(None).await;
        assert!(mock.get_ticket("T1").await.unwrap().is_some());
    }
}

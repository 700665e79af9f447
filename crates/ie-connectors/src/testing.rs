//! Shared fixtures for connector and pipeline tests.

use crate::traits::{
    AuthConfig, ConfigurationItem, ConnectorConfig, ConnectorHealth, ConnectorResult, Ticket,
    TicketNote,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Creates a test connector config with sensible defaults.
pub fn test_connector_config(name: &str, base_url: &str) -> ConnectorConfig {
    ConnectorConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        auth: AuthConfig::None,
        timeout_secs: 30,
        max_retries: 0,
        verify_tls: true,
        headers: HashMap::new(),
    }
}

/// Creates a ticket created at `created_at`.
pub fn sample_ticket_at(id: &str, summary: &str, created_at: DateTime<Utc>) -> Ticket {
    Ticket {
        id: id.to_string(),
        number: format!("INC{}", id.trim_start_matches("INC")),
        short_description: summary.to_string(),
        description: String::new(),
        state: "1".to_string(),
        parent_id: None,
        configuration_item: None,
        created_at,
        updated_at: created_at,
        url: Some(format!("https://example.service-now.com/incident.do?sys_id={}", id)),
        fields: HashMap::new(),
    }
}

/// Creates a ticket created now.
pub fn sample_ticket(id: &str, summary: &str) -> Ticket {
    sample_ticket_at(id, summary, Utc::now())
}

/// Creates a note written at `created_at`.
pub fn sample_note(text: &str, created_at: DateTime<Utc>) -> TicketNote {
    TicketNote {
        text: text.to_string(),
        created_at,
        created_by: "service.desk".to_string(),
    }
}

/// Creates a configuration item.
pub fn sample_ci(
    id: &str,
    name: &str,
    ip_address: Option<&str>,
    fqdn: Option<&str>,
) -> ConfigurationItem {
    ConfigurationItem {
        id: id.to_string(),
        name: name.to_string(),
        class: "cmdb_ci_server".to_string(),
        ip_address: ip_address.map(String::from),
        fqdn: fqdn.map(String::from),
        attributes: HashMap::new(),
    }
}

/// Asserts that a connector health check returns healthy.
pub fn assert_healthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Healthy) => {}
        other => panic!("Expected Healthy, got {:?}", other),
    }
}

/// Asserts that a connector health check returns unhealthy.
pub fn assert_unhealthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Unhealthy(_)) => {}
        other => panic!("Expected Unhealthy, got {:?}", other),
    }
}

//! ServiceNow connector.
//!
//! Implements both the ticket system (incident table, journal entries) and the
//! CI inventory (`cmdb_ci` table) against the ServiceNow Table API.

use crate::http::HttpClient;
use crate::secure_string::SecureString;
use crate::traits::{
    AuthConfig, CiRepositoryConnector, CiSearchQuery, ConfigurationItem, Connector,
    ConnectorCategory, ConnectorConfig, ConnectorError, ConnectorHealth, ConnectorResult, Ticket,
    TicketNote, TicketSystemConnector,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Default request timeout when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const INCIDENT_FIELDS: &str = "sys_id,number,short_description,description,state,parent,\
cmdb_ci,sys_created_on,sys_updated_on";
const CI_FIELDS: &str = "sys_id,name,sys_class_name,ip_address,fqdn,host_name,\
operational_status,environment";
const NOTE_FIELDS: &str = "value,sys_created_on,sys_created_by";

/// ServiceNow connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNowConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    /// Table holding the tickets under enrichment.
    #[serde(default = "default_ticket_table")]
    pub ticket_table: String,
    /// Table holding configuration items.
    #[serde(default = "default_ci_table")]
    pub ci_table: String,
}

fn default_ticket_table() -> String {
    "incident".to_string()
}

fn default_ci_table() -> String {
    "cmdb_ci".to_string()
}

impl ServiceNowConfig {
    /// Builds a configuration with Basic auth against `base_url`.
    pub fn basic(base_url: &str, username: &str, password: SecureString) -> Self {
        Self {
            connector: ConnectorConfig {
                name: "servicenow".to_string(),
                base_url: base_url.trim_end_matches('/').to_string(),
                auth: AuthConfig::Basic {
                    username: username.to_string(),
                    password,
                },
                timeout_secs: DEFAULT_TIMEOUT_SECS,
                max_retries: 3,
                verify_tls: true,
                headers: HashMap::from([("Accept".to_string(), "application/json".to_string())]),
            },
            ticket_table: default_ticket_table(),
            ci_table: default_ci_table(),
        }
    }

    /// Reads credentials for `environment` from process environment variables.
    ///
    /// For each key (`URL`, `USERNAME`, `PASSWORD`, `VERIFY_SSL`, `TIMEOUT`) the
    /// prefixes `<ENV>_SERVICENOW`, `SERVICENOW_<ENV>` and `SERVICENOW` are
    /// tried in order.
    pub fn from_environment(environment: &str) -> ConnectorResult<Self> {
        Self::from_lookup(environment, |key| {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        })
    }

    /// Same as [`from_environment`](Self::from_environment) with a custom lookup.
    pub fn from_lookup<F>(environment: &str, lookup: F) -> ConnectorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = environment.to_uppercase();
        let prefixes = [
            format!("{}_SERVICENOW", env),
            format!("SERVICENOW_{}", env),
            "SERVICENOW".to_string(),
        ];
        let find = |suffix: &str| {
            prefixes
                .iter()
                .find_map(|prefix| lookup(&format!("{}_{}", prefix, suffix)))
        };

        let (Some(url), Some(username), Some(password)) =
            (find("URL"), find("USERNAME"), find("PASSWORD"))
        else {
            return Err(ConnectorError::ConfigError(format!(
                "Missing ServiceNow credentials for {}. Ensure SERVICENOW_{}_URL/USERNAME/PASSWORD are set.",
                environment, env
            )));
        };

        let mut config = Self::basic(&url, &username, SecureString::new(password));
        config.connector.verify_tls = find("VERIFY_SSL")
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        config.connector.timeout_secs = match find("TIMEOUT") {
            Some(raw) => raw.parse().map_err(|_| {
                ConnectorError::ConfigError(format!("Invalid ServiceNow timeout: {}", raw))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        Ok(config)
    }
}

/// ServiceNow connector.
pub struct ServiceNowConnector {
    config: ServiceNowConfig,
    client: HttpClient,
}

impl ServiceNowConnector {
    pub fn new(config: ServiceNowConfig) -> ConnectorResult<Self> {
        let client = HttpClient::new(config.connector.clone())?;
        info!(
            base_url = %config.connector.base_url,
            ticket_table = %config.ticket_table,
            "ServiceNow connector initialized"
        );
        Ok(Self { config, client })
    }

    fn record_path(&self, sys_id: &str) -> String {
        format!(
            "/api/now/table/{}/{}",
            self.config.ticket_table,
            urlencoding::encode(sys_id)
        )
    }

    async fn query_cis(&self, query: &str, limit: usize) -> ConnectorResult<Vec<ConfigurationItem>> {
        let path = format!(
            "/api/now/table/{}?sysparm_query={}&sysparm_limit={}&sysparm_fields={}",
            self.config.ci_table,
            urlencoding::encode(query),
            limit,
            CI_FIELDS
        );
        let response: SnowListResponse = self.client.get_json(&path).await?;
        let records = response.into_result()?;
        debug!(query, count = records.len(), "CMDB query completed");
        Ok(records.iter().map(parse_ci).collect())
    }

    fn parse_ticket(record: &SnowRecord, base_url: &str) -> Ticket {
        let id = field(record, "sys_id").unwrap_or_default();
        Ticket {
            number: field(record, "number").unwrap_or_else(|| id.clone()),
            short_description: field(record, "short_description").unwrap_or_default(),
            description: field(record, "description").unwrap_or_default(),
            state: field(record, "state").unwrap_or_else(|| "1".to_string()),
            parent_id: field(record, "parent"),
            configuration_item: field(record, "cmdb_ci"),
            created_at: timestamp(record, "sys_created_on").unwrap_or_else(Utc::now),
            updated_at: timestamp(record, "sys_updated_on").unwrap_or_else(Utc::now),
            url: Some(format!(
                "{}/incident.do?sys_id={}",
                base_url.trim_end_matches('/'),
                id
            )),
            fields: record.clone(),
            id,
        }
    }
}

#[async_trait]
impl Connector for ServiceNowConnector {
    fn name(&self) -> &str {
        &self.config.connector.name
    }

    fn connector_type(&self) -> &str {
        "itsm"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::Itsm
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        match self
            .client
            .get("/api/now/table/sys_user?sysparm_limit=1")
            .await
        {
            Ok(r) if r.status().is_success() => Ok(ConnectorHealth::Healthy),
            Ok(_) => Ok(ConnectorHealth::Degraded("Unexpected response".into())),
            Err(ConnectorError::AuthenticationFailed(e)) => {
                Ok(ConnectorHealth::Unhealthy(format!("Auth failed: {}", e)))
            }
            Err(ConnectorError::ConnectionFailed(e)) => Ok(ConnectorHealth::Unhealthy(format!(
                "Connection failed: {}",
                e
            ))),
            Err(e) => Ok(ConnectorHealth::Unhealthy(e.to_string())),
        }
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        let r = self
            .client
            .get("/api/now/table/sys_user?sysparm_limit=1")
            .await?;
        Ok(r.status().is_success())
    }
}

#[async_trait]
impl TicketSystemConnector for ServiceNowConnector {
    #[instrument(skip(self))]
    async fn get_ticket(&self, ticket_id: &str) -> ConnectorResult<Option<Ticket>> {
        let path = format!("{}?sysparm_fields={}", self.record_path(ticket_id), INCIDENT_FIELDS);
        let response: SnowResponse = match self.client.get_json(&path).await {
            Ok(r) => r,
            Err(ConnectorError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = response.into_result()?;
        Ok(Some(Self::parse_ticket(
            &record,
            &self.config.connector.base_url,
        )))
    }

    #[instrument(skip(self))]
    async fn get_notes(&self, ticket_id: &str, limit: usize) -> ConnectorResult<Vec<TicketNote>> {
        let query = format!(
            "element_id={}^elementINwork_notes,comments^ORDERBYDESCsys_created_on",
            ticket_id
        );
        let path = format!(
            "/api/now/table/sys_journal_field?sysparm_query={}&sysparm_limit={}&sysparm_fields={}",
            urlencoding::encode(&query),
            limit,
            NOTE_FIELDS
        );
        let response: SnowListResponse = self.client.get_json(&path).await?;
        let mut notes: Vec<TicketNote> = response
            .into_result()?
            .iter()
            .filter_map(|r| {
                Some(TicketNote {
                    text: field(r, "value")?,
                    created_at: timestamp(r, "sys_created_on")?,
                    created_by: field(r, "sys_created_by").unwrap_or_default(),
                })
            })
            .collect();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }

    #[instrument(skip(self, text))]
    async fn annotate(&self, ticket_id: &str, text: &str) -> ConnectorResult<()> {
        let body = serde_json::json!({ "work_notes": text });
        let response: SnowResponse = self
            .client
            .patch_json(&self.record_path(ticket_id), &body)
            .await?;
        response.into_result()?;
        info!(ticket_id, "Work note added");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn link_configuration_item(&self, ticket_id: &str, ci_id: &str) -> ConnectorResult<()> {
        let body = serde_json::json!({ "cmdb_ci": ci_id });
        let response: SnowResponse = self
            .client
            .patch_json(&self.record_path(ticket_id), &body)
            .await?;
        response.into_result()?;
        info!(ticket_id, ci_id, "Configuration item linked");
        Ok(())
    }
}

#[async_trait]
impl CiRepositoryConnector for ServiceNowConnector {
    #[instrument(skip(self))]
    async fn find_by_ip(&self, ip: &str) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.query_cis(&format!("ip_address={}", ip), 10).await
    }

    #[instrument(skip(self))]
    async fn find_by_fqdn(&self, host: &str) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.query_cis(&format!("fqdn={}^ORhost_name={}", host, host), 10)
            .await
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &CiSearchQuery) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.query_cis(&format!("nameLIKE{}", query.name), query.limit)
            .await
    }
}

// ServiceNow API response types

type SnowRecord = HashMap<String, serde_json::Value>;

#[derive(Debug, Default, Deserialize)]
struct SnowResponse {
    result: Option<SnowRecord>,
}

impl SnowResponse {
    fn into_result(self) -> ConnectorResult<SnowRecord> {
        self.result.ok_or_else(|| {
            ConnectorError::InvalidResponse("ServiceNow response missing 'result'".into())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SnowListResponse {
    result: Option<Vec<SnowRecord>>,
}

impl SnowListResponse {
    fn into_result(self) -> ConnectorResult<Vec<SnowRecord>> {
        self.result.ok_or_else(|| {
            ConnectorError::InvalidResponse("ServiceNow response missing 'result'".into())
        })
    }
}

/// Reads a string field, unwrapping reference fields (`{"value": ..., "link": ...}`).
fn field(record: &SnowRecord, key: &str) -> Option<String> {
    let value = record.get(key)?;
    let raw = match value {
        serde_json::Value::Object(map) => map.get("value")?.as_str()?,
        other => other.as_str()?,
    };
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Parses ServiceNow (`2024-01-15 10:30:00`, UTC) or RFC 3339 timestamps.
fn timestamp(record: &SnowRecord, key: &str) -> Option<DateTime<Utc>> {
    let raw = field(record, key)?;
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn parse_ci(record: &SnowRecord) -> ConfigurationItem {
    ConfigurationItem {
        id: field(record, "sys_id").unwrap_or_default(),
        name: field(record, "name").unwrap_or_default(),
        class: field(record, "sys_class_name").unwrap_or_else(|| "cmdb_ci".to_string()),
        ip_address: field(record, "ip_address"),
        fqdn: field(record, "fqdn").or_else(|| field(record, "host_name")),
        attributes: record.clone(),
    }
}

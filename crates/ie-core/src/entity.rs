//! Extracted entity model, merge and validation rules.

use crate::error::EnrichmentError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

/// Kinds of technical entities found in ticket text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    IpAddress,
    Hostname,
    System,
    User,
    Software,
    ErrorCode,
    NetworkDevice,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::IpAddress,
        EntityType::Hostname,
        EntityType::System,
        EntityType::User,
        EntityType::Software,
        EntityType::ErrorCode,
        EntityType::NetworkDevice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::IpAddress => "IP_ADDRESS",
            EntityType::Hostname => "HOSTNAME",
            EntityType::System => "SYSTEM",
            EntityType::User => "USER",
            EntityType::Software => "SOFTWARE",
            EntityType::ErrorCode => "ERROR_CODE",
            EntityType::NetworkDevice => "NETWORK_DEVICE",
        }
    }

    /// Maps a language model category key onto an entity type.
    ///
    /// Accepts plural snake case ("ip_addresses"), singular ("ip_address") and
    /// the canonical upper case names.
    pub fn from_category(category: &str) -> Option<Self> {
        let normalized = category.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let ty = match normalized.as_str() {
            "ip_addresses" | "ip_address" | "ips" | "ip" => EntityType::IpAddress,
            "hostnames" | "hostname" | "hosts" | "fqdns" | "fqdn" => EntityType::Hostname,
            "systems" | "system" | "servers" | "server" => EntityType::System,
            "users" | "user" | "usernames" | "emails" | "email" => EntityType::User,
            "software" | "applications" | "application" | "services" => EntityType::Software,
            "error_codes" | "error_code" | "errors" => EntityType::ErrorCode,
            "network_devices" | "network_device" | "devices" => EntityType::NetworkDevice,
            _ => return None,
        };
        Some(ty)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySource {
    Llm,
    Regex,
    Manual,
}

impl EntitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySource::Llm => "llm",
            EntitySource::Regex => "regex",
            EntitySource::Manual => "manual",
        }
    }
}

/// A typed, confidence-scored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
    /// Confidence in 0.0-1.0.
    pub confidence: f64,
    pub source: EntitySource,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Why the entity was rejected; `None` means it is usable for matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl ExtractedEntity {
    pub fn new(
        entity_type: EntityType,
        value: impl Into<String>,
        confidence: f64,
        source: EntitySource,
    ) -> Self {
        Self {
            entity_type,
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            metadata: HashMap::new(),
            invalid_reason: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Uniqueness key. Values compare case-insensitively.
    pub fn key(&self) -> (EntityType, String) {
        (self.entity_type, self.value.to_lowercase())
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

/// Merges `incoming` into `base`, keyed by `(type, value)`.
///
/// For duplicate keys the higher-confidence entity wins (ties keep the one
/// already in `base`) and metadata from both is unioned, the winner's values
/// taking precedence. First-seen order is preserved.
pub fn merge_entities(
    base: Vec<ExtractedEntity>,
    incoming: Vec<ExtractedEntity>,
) -> Vec<ExtractedEntity> {
    let mut merged: Vec<ExtractedEntity> = Vec::with_capacity(base.len() + incoming.len());
    let mut index: HashMap<(EntityType, String), usize> = HashMap::new();

    for entity in base.into_iter().chain(incoming) {
        match index.get(&entity.key()) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                if entity.confidence > existing.confidence {
                    let mut metadata = std::mem::take(&mut existing.metadata);
                    let mut winner = entity;
                    for (k, v) in winner.metadata.drain() {
                        metadata.insert(k, v);
                    }
                    winner.metadata = metadata;
                    *existing = winner;
                } else {
                    for (k, v) in entity.metadata {
                        existing.metadata.entry(k).or_insert(v);
                    }
                }
            }
            None => {
                index.insert(entity.key(), merged.len());
                merged.push(entity);
            }
        }
    }
    merged
}

/// Checks the format of a single entity value.
pub fn check_format(entity_type: EntityType, value: &str) -> Result<(), EnrichmentError> {
    let value = value.trim();
    let fail = |reason: &str| Err(EnrichmentError::Validation(format!("{}: {}", reason, value)));

    match entity_type {
        EntityType::IpAddress => {
            let (addr, prefix) = match value.split_once('/') {
                Some((addr, prefix)) => (addr, Some(prefix)),
                None => (value, None),
            };
            if addr.parse::<Ipv4Addr>().is_err() {
                return fail("invalid IPv4 address");
            }
            if let Some(prefix) = prefix {
                match prefix.parse::<u8>() {
                    Ok(p) if p <= 32 => {}
                    _ => return fail("invalid CIDR prefix"),
                }
            }
            Ok(())
        }
        EntityType::Hostname => {
            if value.len() < 3 || value.len() > 253 {
                return fail("hostname length out of range");
            }
            let valid_labels = value.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            });
            if !valid_labels {
                return fail("invalid hostname label");
            }
            Ok(())
        }
        EntityType::System | EntityType::NetworkDevice => {
            if value.len() < 3 {
                return fail("name too short");
            }
            if !value.chars().any(|c| c.is_ascii_alphanumeric()) {
                return fail("name has no alphanumerics");
            }
            Ok(())
        }
        EntityType::User => {
            if let Some((local, domain)) = value.split_once('@') {
                if local.is_empty() || !domain.contains('.') {
                    return fail("invalid email address");
                }
            } else if value.len() < 3 {
                return fail("username too short");
            }
            if value.chars().any(char::is_whitespace) {
                return fail("user contains whitespace");
            }
            Ok(())
        }
        EntityType::Software => {
            if value.len() < 2 {
                return fail("software name too short");
            }
            Ok(())
        }
        EntityType::ErrorCode => {
            if value.len() < 3 || !value.chars().any(|c| c.is_ascii_digit()) {
                return fail("error code must contain digits");
            }
            Ok(())
        }
    }
}

/// Flags entities that fail format checks or fall below `min_confidence`.
///
/// Invalid entities stay in the list for auditing.
pub fn validate_entities(entities: &mut [ExtractedEntity], min_confidence: f64) {
    for entity in entities.iter_mut() {
        entity.invalid_reason = if entity.confidence < min_confidence {
            Some(format!(
                "confidence {:.2} below minimum {:.2}",
                entity.confidence, min_confidence
            ))
        } else {
            check_format(entity.entity_type, &entity.value)
                .err()
                .map(|e| e.to_string())
        };
    }
}

/// Groups valid entity values by type, preserving order.
pub fn group_by_type(entities: &[ExtractedEntity]) -> BTreeMap<EntityType, Vec<String>> {
    let mut grouped: BTreeMap<EntityType, Vec<String>> = BTreeMap::new();
    for entity in entities.iter().filter(|e| e.is_valid()) {
        grouped
            .entry(entity.entity_type)
            .or_default()
            .push(entity.value.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_higher_confidence_and_unions_metadata() {
        let llm = ExtractedEntity::new(EntityType::NetworkDevice, "PA-3220", 0.6, EntitySource::Llm)
            .with_metadata("llm_category", "network_devices");
        let regex =
            ExtractedEntity::new(EntityType::NetworkDevice, "PA-3220", 0.85, EntitySource::Regex)
                .with_metadata("vendor", "Palo Alto Networks");

        let merged = merge_entities(vec![llm], vec![regex]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, EntitySource::Regex);
        assert_eq!(merged[0].confidence, 0.85);
        assert_eq!(merged[0].metadata["vendor"], "Palo Alto Networks");
        assert_eq!(merged[0].metadata["llm_category"], "network_devices");
    }

    #[test]
    fn test_merge_is_order_independent_for_winner() {
        let a = ExtractedEntity::new(EntityType::IpAddress, "10.0.0.1", 0.95, EntitySource::Regex)
            .with_metadata("pattern", "ipv4");
        let b = ExtractedEntity::new(EntityType::IpAddress, "10.0.0.1", 0.7, EntitySource::Llm)
            .with_metadata("pattern", "ignored")
            .with_metadata("from_model", true);

        for merged in [
            merge_entities(vec![a.clone()], vec![b.clone()]),
            merge_entities(vec![b], vec![a]),
        ] {
            assert_eq!(merged.len(), 1);
            assert_eq!(merged[0].confidence, 0.95);
            assert_eq!(merged[0].metadata["pattern"], "ipv4");
            assert_eq!(merged[0].metadata["from_model"], true);
        }
    }

    #[test]
    fn test_merge_keys_are_case_insensitive_and_typed() {
        let merged = merge_entities(
            vec![ExtractedEntity::new(EntityType::Hostname, "WEB01.corp.com", 0.5, EntitySource::Llm)],
            vec![
                ExtractedEntity::new(EntityType::Hostname, "web01.corp.com", 0.6, EntitySource::Regex),
                ExtractedEntity::new(EntityType::System, "web01.corp.com", 0.5, EntitySource::Regex),
            ],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].value, "web01.corp.com");
    }

    #[test]
    fn test_check_format() {
        assert!(check_format(EntityType::IpAddress, "192.168.1.5").is_ok());
        assert!(check_format(EntityType::IpAddress, "10.0.0.0/24").is_ok());
        assert!(check_format(EntityType::IpAddress, "10.0.0.0/33").is_err());
        assert!(check_format(EntityType::IpAddress, "999.1.1.1").is_err());
        assert!(check_format(EntityType::Hostname, "db-01.corp.example.com").is_ok());
        assert!(check_format(EntityType::Hostname, "-bad.example.com").is_err());
        assert!(check_format(EntityType::Hostname, "a..b").is_err());
        assert!(check_format(EntityType::User, "jane.doe@example.com").is_ok());
        assert!(check_format(EntityType::User, "@example.com").is_err());
        assert!(check_format(EntityType::User, "jd").is_err());
        assert!(check_format(EntityType::ErrorCode, "ORA-12541").is_ok());
        assert!(check_format(EntityType::ErrorCode, "ERROR").is_err());
        assert!(check_format(EntityType::System, "x").is_err());
    }

    #[test]
    fn test_validate_flags_but_keeps_entities() {
        let mut entities = vec![
            ExtractedEntity::new(EntityType::IpAddress, "10.1.1.1", 0.95, EntitySource::Regex),
            ExtractedEntity::new(EntityType::System, "srv01", 0.2, EntitySource::Llm),
            ExtractedEntity::new(EntityType::IpAddress, "300.1.1.1", 0.9, EntitySource::Llm),
        ];
        validate_entities(&mut entities, 0.3);

        assert_eq!(entities.len(), 3);
        assert!(entities[0].is_valid());
        assert!(entities[1].invalid_reason.as_deref().unwrap().contains("below minimum"));
        assert!(!entities[2].is_valid());

        let grouped = group_by_type(&entities);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&EntityType::IpAddress], vec!["10.1.1.1".to_string()]);
    }

    #[test]
    fn test_from_category() {
        assert_eq!(EntityType::from_category("ip_addresses"), Some(EntityType::IpAddress));
        assert_eq!(EntityType::from_category("Network Devices"), Some(EntityType::NetworkDevice));
        assert_eq!(EntityType::from_category("ERROR_CODE"), Some(EntityType::ErrorCode));
        assert_eq!(EntityType::from_category("weather"), None);
        for ty in EntityType::ALL {
            assert_eq!(EntityType::from_category(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn test_entity_type_serializes_upper_snake() {
        let json = serde_json::to_string(&EntityType::NetworkDevice).unwrap();
        assert_eq!(json, "\"NETWORK_DEVICE\"");
        let entity = ExtractedEntity::new(EntityType::User, "jdoe", 0.5, EntitySource::Regex);
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["type"], "USER");
        assert_eq!(value["source"], "REGEX");
        assert!(value.get("invalid_reason").is_none());
    }
}

//! CI matching.
//!
//! Each valid entity is looked up against the CI repository by one strategy
//! chosen from its type. Every strategy assigns a fixed confidence. Results
//! are deduplicated by CI id (highest confidence wins) and partitioned by the
//! configured threshold.

use crate::clock::Clock;
use crate::entity::{EntityType, ExtractedEntity};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use ie_connectors::{CiRepositoryConnector, CiSearchQuery, ConfigurationItem, ConnectorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Confidence assigned to an exact IP match.
pub const IP_MATCH_CONFIDENCE: u8 = 95;
/// Confidence assigned to a hostname/FQDN match.
pub const FQDN_MATCH_CONFIDENCE: u8 = 95;
/// Confidence assigned to a name search hit.
pub const NAME_MATCH_CONFIDENCE: u8 = 85;

/// How a candidate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchSource {
    Inventory,
    Manual,
}

/// Lookup strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStrategy {
    Ip,
    Fqdn,
    Name,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Ip => "ip",
            MatchStrategy::Fqdn => "fqdn",
            MatchStrategy::Name => "name",
        }
    }

    pub fn confidence(&self) -> u8 {
        match self {
            MatchStrategy::Ip => IP_MATCH_CONFIDENCE,
            MatchStrategy::Fqdn => FQDN_MATCH_CONFIDENCE,
            MatchStrategy::Name => NAME_MATCH_CONFIDENCE,
        }
    }

    /// Strategy used for an entity, if any.
    pub fn for_entity(entity: &ExtractedEntity) -> Option<Self> {
        match entity.entity_type {
            // Networks are not single CIs.
            EntityType::IpAddress if entity.value.contains('/') => None,
            EntityType::IpAddress => Some(MatchStrategy::Ip),
            EntityType::Hostname => Some(MatchStrategy::Fqdn),
            EntityType::System | EntityType::NetworkDevice => Some(MatchStrategy::Name),
            _ => None,
        }
    }
}

/// A CI considered for linking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiMatchCandidate {
    pub id: String,
    pub name: String,
    pub class: String,
    /// 0-100.
    pub confidence: u8,
    pub source: MatchSource,
    pub matched_at: DateTime<Utc>,
    pub reason: String,
}

impl CiMatchCandidate {
    pub fn from_inventory(
        item: &ConfigurationItem,
        confidence: u8,
        reason: impl Into<String>,
        matched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            class: item.class.clone(),
            confidence: confidence.min(100),
            source: MatchSource::Inventory,
            matched_at,
            reason: reason.into(),
        }
    }

    /// A candidate chosen by a person.
    pub fn manual(
        id: impl Into<String>,
        name: impl Into<String>,
        class: impl Into<String>,
        matched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class: class.into(),
            confidence: 100,
            source: MatchSource::Manual,
            matched_at,
            reason: "selected manually".to_string(),
        }
    }
}

/// Outcome of matching one set of entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiMatchResult {
    /// Deduplicated candidates, highest confidence first.
    pub matches: Vec<CiMatchCandidate>,
    pub high_confidence_matches: Vec<CiMatchCandidate>,
    pub low_confidence_matches: Vec<CiMatchCandidate>,
    /// Mean candidate confidence, 0 with no matches.
    pub overall_confidence: f64,
}

impl CiMatchResult {
    /// Builds a result from raw matches in discovery order.
    pub fn from_raw(raw: Vec<CiMatchCandidate>, threshold: u8) -> Self {
        let matches = dedup_by_id(raw);
        let (high, low): (Vec<_>, Vec<_>) = matches
            .iter()
            .cloned()
            .partition(|c| c.confidence >= threshold);

        let overall_confidence = if matches.is_empty() {
            0.0
        } else {
            matches.iter().map(|c| c.confidence as f64).sum::<f64>() / matches.len() as f64
        };

        Self {
            matches,
            high_confidence_matches: high,
            low_confidence_matches: low,
            overall_confidence,
        }
    }

    /// The top high-confidence match.
    pub fn recommended_ci(&self) -> Option<&CiMatchCandidate> {
        self.high_confidence_matches.first()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Keeps one candidate per CI id, the highest-confidence one (first seen on
/// ties), sorted by confidence descending. The sort is stable.
pub fn dedup_by_id(raw: Vec<CiMatchCandidate>) -> Vec<CiMatchCandidate> {
    let mut deduped: Vec<CiMatchCandidate> = Vec::with_capacity(raw.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for candidate in raw {
        match index.get(&candidate.id) {
            Some(&pos) => {
                if candidate.confidence > deduped[pos].confidence {
                    deduped[pos] = candidate;
                }
            }
            None => {
                index.insert(candidate.id.clone(), deduped.len());
                deduped.push(candidate);
            }
        }
    }

    deduped.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    deduped
}

/// Matches extracted entities against the CI repository.
pub struct CiMatcher {
    repository: Arc<dyn CiRepositoryConnector>,
    threshold: u8,
    name_limit: usize,
    clock: Arc<dyn Clock>,
}

impl CiMatcher {
    pub fn new(
        repository: Arc<dyn CiRepositoryConnector>,
        threshold: u8,
        name_limit: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            threshold,
            name_limit,
            clock,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Runs every applicable strategy concurrently and merges the results.
    ///
    /// A failing lookup is logged and contributes nothing; it never aborts
    /// the other lookups.
    #[instrument(skip(self, entities), fields(entities = entities.len()))]
    pub async fn match_entities(&self, entities: &[ExtractedEntity]) -> CiMatchResult {
        let now = self.clock.now();
        let lookups = entities
            .iter()
            .filter(|e| e.is_valid())
            .filter_map(|e| MatchStrategy::for_entity(e).map(|s| (s, e)))
            .map(|(strategy, entity)| self.lookup(strategy, entity, now));

        let raw: Vec<CiMatchCandidate> = join_all(lookups).await.into_iter().flatten().collect();
        let result = CiMatchResult::from_raw(raw, self.threshold);

        debug!(
            matches = result.matches.len(),
            high = result.high_confidence_matches.len(),
            low = result.low_confidence_matches.len(),
            "CI matching complete"
        );
        result
    }

    async fn lookup(
        &self,
        strategy: MatchStrategy,
        entity: &ExtractedEntity,
        now: DateTime<Utc>,
    ) -> Vec<CiMatchCandidate> {
        let value = entity.value.trim();
        let result: ConnectorResult<Vec<ConfigurationItem>> = match strategy {
            MatchStrategy::Ip => self.repository.find_by_ip(value).await,
            MatchStrategy::Fqdn => self.repository.find_by_fqdn(value).await,
            MatchStrategy::Name => {
                self.repository
                    .search(&CiSearchQuery::by_name(value, self.name_limit))
                    .await
            }
        };

        match result {
            Ok(items) => {
                metrics::counter!(
                    "ie_ci_lookups_total",
                    "strategy" => strategy.as_str(),
                    "status" => "ok"
                )
                .increment(1);
                let reason = match strategy {
                    MatchStrategy::Ip => format!("IP address {} matches", value),
                    MatchStrategy::Fqdn => format!("Hostname {} matches", value),
                    MatchStrategy::Name => format!("Name matches \"{}\"", value),
                };
                let limit = match strategy {
                    MatchStrategy::Name => self.name_limit,
                    _ => items.len(),
                };
                items
                    .iter()
                    .take(limit)
                    .map(|item| {
                        CiMatchCandidate::from_inventory(
                            item,
                            strategy.confidence(),
                            reason.clone(),
                            now,
                        )
                    })
                    .collect()
            }
            Err(e) => {
                warn!(
                    strategy = strategy.as_str(),
                    value = %value,
                    error = %e,
                    "CI lookup failed"
                );
                metrics::counter!(
                    "ie_ci_lookups_total",
                    "strategy" => strategy.as_str(),
                    "status" => "error"
                )
                .increment(1);
                Vec::new()
            }
        }
    }
}

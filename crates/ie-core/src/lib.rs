//! # ie-core
//!
//! Incident enrichment pipeline.
//!
//! Tickets are tracked in an [`EnrichmentState`] and moved through the
//! [`EnrichmentOrchestrator`]: entities are extracted from the summary and
//! work notes, matched against the configuration item inventory, and either
//! linked automatically or put to a human through a clarification prompt.

pub mod cache;
pub mod clarification;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod sweep;

pub use cache::TtlCache;
pub use clarification::{ClarificationCoordinator, ManualResolution, PendingClarification};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EnrichmentConfig;
pub use entity::{EntitySource, EntityType, ExtractedEntity};
pub use error::{EnrichmentError, EnrichmentResult};
pub use extractor::{EntityExtractor, ExtractionOutcome, IssueIntent, PatternTable};
pub use matcher::{CiMatchCandidate, CiMatchResult, CiMatcher, MatchSource, MatchStrategy};
pub use orchestrator::{EnrichmentOrchestrator, EnrichmentOutcome, EnrichmentServices};
pub use state::{ConfidenceScores, EnrichmentStage, EnrichmentState};
pub use store::{EnrichmentStateStore, InMemoryStateStore, StoreError};
#[cfg(feature = "database")]
pub use store::SqliteStateStore;
pub use sweep::{SweepReport, SweepRunner};

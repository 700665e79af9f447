//! Configuration item inventory connectors.
//!
//! The production inventory is ServiceNow's `cmdb_ci` table, served by
//! [`ServiceNowConnector`](crate::itsm::ServiceNowConnector).

pub mod mock;

pub use mock::{LookupKind, MockCiRepository};

//! Ticket system connectors.

pub mod mock;
pub mod servicenow;

pub use mock::MockTicketSystem;
pub use servicenow::{ServiceNowConfig, ServiceNowConnector};

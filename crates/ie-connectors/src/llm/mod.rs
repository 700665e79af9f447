//! Language model connectors used for entity extraction.

pub mod mock;
pub mod openai;

pub use mock::MockLanguageModel;
pub use openai::{OpenAiConfig, OpenAiExtractionModel};

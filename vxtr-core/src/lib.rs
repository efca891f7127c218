//! Core library for the vxtr structured image extraction service.
//!
//! An image and a task kind go in; a schema-validated typed record comes
//! out. In between sit the prompt builder, a swappable model gateway, and
//! the bounded validate-and-repair loop in [`service::ExtractionService`].

pub mod config;
pub mod error;
pub mod gateway;
pub mod prompt;
pub mod schema;
pub mod service;
pub mod validate;

pub use config::AppConfig;
pub use config::AppPaths;
pub use config::ConfigBundle;
pub use config::StorageSettings;
pub use config::load_or_initialize_config;
pub use error::AttemptFailure;
pub use error::ExtractError;
pub use error::ExtractResult;
pub use error::GatewayError;
pub use gateway::GatewaySettings;
pub use gateway::ImageSource;
pub use gateway::Message;
pub use gateway::ModelGateway;
pub use gateway::OllamaGateway;
pub use gateway::RawModelOutput;
pub use schema::FieldSpec;
pub use schema::FieldType;
pub use schema::Schema;
pub use schema::SchemaOverride;
pub use schema::SchemaRegistry;
pub use schema::TaskKind;
pub use service::ExtractionRequest;
pub use service::ExtractionService;
pub use validate::FieldValue;
pub use validate::Record;
pub use validate::ValidationOutcome;

//! These models represent the objects passed around by the agent
//!
//! The completion service speaks in role-tagged messages, while functions are described
//! to it by name, description and a JSON schema of their parameters. We always immediately
//! convert provider-specific formats into these internal structs, so the orchestrator
//! never has to inspect raw JSON to decide what a message is.
pub mod message;
pub mod role;
pub mod tool;

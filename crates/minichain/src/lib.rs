pub mod agent;
pub mod cache;
pub mod errors;
pub mod function;
pub mod history;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod sandbox;

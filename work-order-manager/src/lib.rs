// Audit trail record builders
pub mod activity;

// Workflow catalog and builtin pipelines
pub mod catalog;

// Engine configuration
pub mod config;

// SQLite persistence layer
pub mod database;

// Stage-transition engine
pub mod engine;

// Persisted entities
pub mod models;

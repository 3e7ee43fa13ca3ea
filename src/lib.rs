pub mod api_client;
pub mod cache;
pub mod config;
pub mod countries;
pub mod dates;
pub mod error;
pub mod frame;
pub mod jsonpath;
pub mod mapping;
pub mod marshalling;
pub mod naming;
pub mod object_store;
pub mod orchestrator;
pub mod paths;
pub mod query;
pub mod rules;
pub mod runner;
pub mod schema;
pub mod source;
pub mod table;
pub mod task;
pub mod tasks;
pub mod template;
pub mod timezone;
pub mod warehouse;

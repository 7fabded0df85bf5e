pub mod client;
pub mod config;
pub mod error;
pub mod grader;
pub mod handlers;
pub mod judge;
pub mod language;
pub mod lock;
pub mod paths;
pub mod period;
pub mod problem;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod scoring;
pub mod store;
pub mod submission;
pub mod submit;
pub mod types;
pub mod utils;
pub mod verdict;
pub mod worker;

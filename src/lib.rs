pub mod cli;
pub mod config;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod recognizer;
pub mod reconciler;
pub mod report;
pub mod scanner;
pub mod version;

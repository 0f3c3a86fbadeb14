pub mod api;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod storage;

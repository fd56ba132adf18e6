pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod jobs;
pub mod telemetry;

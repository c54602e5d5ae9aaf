pub mod api;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod db;
pub mod delivery_filter;
pub mod dispatcher;
pub mod error;
pub mod fcm;
pub mod foreground;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod resolver;

// Cyber-chase contest backend: task sessions, team workflow, chat bot and HTTP API.

pub mod api;
pub mod auth;
pub mod bot;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod files;
pub mod mailer;
pub mod metrics;
pub mod workflow;

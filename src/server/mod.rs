pub mod config;
pub mod update_service;

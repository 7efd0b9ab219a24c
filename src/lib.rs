pub mod db;
pub mod proxy;
pub mod server;
pub mod services;
pub mod web;

pub mod envelope;
pub mod error;
pub mod reminders;
pub mod rest;
pub mod rpc_gateway;
pub mod service;
pub mod state;

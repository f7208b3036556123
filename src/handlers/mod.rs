pub mod health_handlers;
pub mod middleware;
pub mod transfer_handlers;

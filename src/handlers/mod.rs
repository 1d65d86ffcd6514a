pub mod auth;
pub mod carts;
pub mod common;
pub mod payments;
pub mod products;
pub mod webhooks;

// Storefront services
pub mod carts;
pub mod products;

// Payment and reconciliation services
pub mod checkout;
pub mod paystack;

pub use carts::CartService;
pub use checkout::CheckoutService;
pub use paystack::{PaymentGateway, PaystackClient};
pub use products::ProductService;

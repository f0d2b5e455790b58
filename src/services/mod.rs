// Core services
pub mod carts;
pub mod checkout;
pub mod payment_correlation;
pub mod webhooks;

pub use carts::CartService;
pub use checkout::CheckoutService;
pub use payment_correlation::PaymentCorrelationService;
pub use webhooks::WebhookProcessor;

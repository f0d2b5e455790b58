pub mod carts;
pub mod checkout;
pub mod common;
pub mod webhooks;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::psp::PspGateway;
use crate::services::{CartService, CheckoutService, PaymentCorrelationService, WebhookProcessor};

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub correlations: PaymentCorrelationService,
    pub webhooks: WebhookProcessor,
}

impl AppServices {
    /// Build the services container over a shared pool and PSP gateway.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PspGateway>,
        config: Arc<AppConfig>,
    ) -> Self {
        let carts = CartService::new(db_pool.clone(), event_sender.clone());
        let correlations =
            PaymentCorrelationService::new(db_pool, config.correlation_ttl_secs);
        let webhooks = WebhookProcessor::new(carts.clone(), config.psp_hmac_key.clone());
        let checkout = CheckoutService::new(
            carts.clone(),
            correlations.clone(),
            gateway,
            event_sender,
            config,
        );

        Self {
            carts,
            checkout,
            correlations,
            webhooks,
        }
    }
}

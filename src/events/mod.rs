use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the services after their transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartCreated(Uuid),
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartItemRemoved {
        cart_id: Uuid,
        item_id: Uuid,
    },
    CheckoutStarted {
        cart_id: Uuid,
        order_ref: String,
    },
    OrderStatusChanged {
        cart_id: Uuid,
        old_status: String,
        new_status: String,
    },
    RefundRequested {
        cart_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed
    /// or full. Event delivery is best-effort; the originating transaction has
    /// already committed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

/// Drains the event channel and logs each event with its identifying fields.
/// Runs until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CartCreated(cart_id) => {
                info!(%cart_id, "cart created");
            }
            Event::CartItemAdded {
                cart_id,
                product_id,
            } => {
                info!(%cart_id, %product_id, "cart item added");
            }
            Event::CartItemRemoved { cart_id, item_id } => {
                info!(%cart_id, %item_id, "cart item removed");
            }
            Event::CheckoutStarted { cart_id, order_ref } => {
                info!(%cart_id, %order_ref, "checkout started");
            }
            Event::OrderStatusChanged {
                cart_id,
                old_status,
                new_status,
            } => {
                info!(%cart_id, %old_status, %new_status, "order status changed");
            }
            Event::RefundRequested { cart_id } => {
                info!(%cart_id, "refund requested");
            }
        }
    }

    info!("Event channel closed; processing loop stopped");
}

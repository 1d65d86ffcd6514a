use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Handle used by services to emit events after their transaction has
/// committed. Failure to enqueue is never propagated to the caller.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is
    /// closed or full. Used on post-commit paths where the state change
    /// already happened.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping event: {}", e);
        }
    }
}

// The events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Account events
    UserRegistered(Uuid),

    // Catalog events
    ProductCreated(Uuid),
    ProductUpdated(Uuid),
    ProductDeleted(Uuid),

    // Cart events
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartReplaced(Uuid),
    CartCleared(Uuid),

    // Payment lifecycle events
    CheckoutInitialized {
        payment_id: Uuid,
        reference: String,
        total_amount: Decimal,
    },
    PaymentSucceeded {
        payment_id: Uuid,
        reference: String,
    },
    PaymentRefundPending {
        payment_id: Uuid,
        reference: String,
    },
}

// Consumes incoming events and logs them. Runs as a background task for
// the lifetime of the server; ends when every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::UserRegistered(user_id) => {
                info!("User registered: {}", user_id);
            }
            Event::ProductCreated(product_id) => {
                info!("Product created: {}", product_id);
            }
            Event::ProductUpdated(product_id) => {
                info!("Product updated: {}", product_id);
            }
            Event::ProductDeleted(product_id) => {
                info!("Product deleted: {}", product_id);
            }
            Event::CartItemAdded {
                cart_id,
                product_id,
                quantity,
            } => {
                info!(
                    "Cart {} gained {} x product {}",
                    cart_id, quantity, product_id
                );
            }
            Event::CartReplaced(cart_id) => {
                info!("Cart replaced: {}", cart_id);
            }
            Event::CartCleared(cart_id) => {
                info!("Cart cleared: {}", cart_id);
            }
            Event::CheckoutInitialized {
                payment_id,
                reference,
                total_amount,
            } => {
                info!(
                    "Checkout initialized: payment={}, reference={}, total={}",
                    payment_id, reference, total_amount
                );
            }
            Event::PaymentSucceeded {
                payment_id,
                reference,
            } => {
                info!(
                    "Payment succeeded: payment={}, reference={}",
                    payment_id, reference
                );
            }
            Event::PaymentRefundPending {
                payment_id,
                reference,
            } => {
                warn!(
                    "Payment flagged pending-refund: payment={}, reference={}",
                    payment_id, reference
                );
            }
        }
    }

    warn!("Event processing loop has ended");
}

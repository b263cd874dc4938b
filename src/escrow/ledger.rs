//! External collaborators of the payment manager

use crate::errors::LotteryResult;
use crate::escrow::types::{ObservedTransfer, Token};
use crate::games::types::UserId;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Live feed of transfers into one address
pub struct AddressSubscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<ObservedTransfer>,
}

/// Ledger view of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending { confirmations: u32 },
    /// Finalized; satisfies any threshold
    Finalized,
    Failed { reason: String },
    NotFound,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_balance(&self, address: &str, token: &Token) -> LotteryResult<u64>;

    /// Transfer from the escrow to `to`; returns the transaction signature
    async fn send_tokens(&self, to: &str, amount: u64, token: &Token) -> LotteryResult<String>;

    fn subscribe_address(&self, address: &str) -> LotteryResult<AddressSubscription>;

    fn unsubscribe(&self, subscription_id: u64);

    async fn confirmation_status(&self, signature: &str) -> LotteryResult<ConfirmationStatus>;
}

/// Maps users to their verified wallet
#[async_trait]
pub trait WalletResolver: Send + Sync {
    async fn primary_wallet(&self, user_id: UserId) -> LotteryResult<Option<String>>;
}

/// Renders a payment URI for presentation (e.g. QR code payload)
#[async_trait]
pub trait PaymentUriEncoder: Send + Sync {
    async fn encode(&self, uri: &str) -> LotteryResult<String>;
}

use crate::games::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Solana token with mint address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_address: Option<String>,
    pub decimals: u8,
}

impl Token {
    /// Native SOL token
    pub fn sol() -> Self {
        Self {
            symbol: "SOL".to_string(),
            mint_address: None,
            decimals: 9,
        }
    }

    /// USDC SPL token
    pub fn usdc() -> Self {
        Self {
            symbol: "USDC".to_string(),
            mint_address: Some("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string()),
            decimals: 6,
        }
    }

    /// Any other SPL token
    pub fn spl(symbol: &str, mint_address: &str, decimals: u8) -> Self {
        Self {
            symbol: symbol.to_string(),
            mint_address: Some(mint_address.to_string()),
            decimals,
        }
    }

    /// Render base units as a decimal string without trailing zeros
    pub fn format_amount(&self, base_units: u64) -> String {
        let scale = 10u64.pow(self.decimals as u32);
        let whole = base_units / scale;
        let frac = base_units % scale;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{:0width$}", frac, width = self.decimals as usize);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }
}

/// Payment lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    AwaitingPayment,
    Confirming,
    Confirmed,
    Distributing,
    Completed,
    Expired,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Initiated, AwaitingPayment)
                | (AwaitingPayment, Confirming)
                | (AwaitingPayment, Expired)
                | (Confirming, Confirmed)
                | (Confirming, Failed)
                | (Confirmed, Distributing)
                | (Distributing, Completed)
                | (Distributing, Failed)
                | (Completed, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Expired | PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::AwaitingPayment => "AWAITING_PAYMENT",
            PaymentStatus::Confirming => "CONFIRMING",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Distributing => "DISTRIBUTING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        };
        write!(f, "{}", name)
    }
}

/// Transfer seen on the escrow address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedTransfer {
    pub signature: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_address: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributionRecord {
    pub fee: u64,
    pub net_amount: u64,
    /// None when the fee rounded down to zero and no transfer was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treasury_signature: Option<String>,
    pub distributed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundRecord {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
}

/// Result of a refund attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { signature: String },
    PendingApproval,
}

/// Where one survivor's prize transfer stands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WinnerTransferStatus {
    Pending,
    /// Persisted right before the ledger call; never retried automatically
    Sending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinnerTransfer {
    pub user_id: UserId,
    pub amount: u64,
    pub status: WinnerTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

/// Prize transfers out of the escrow for one finished paid game
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinningsRecord {
    pub game_id: String,
    pub token: Token,
    pub prize_per_survivor: u64,
    pub winners: Vec<WinnerTransfer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WinningsRecord {
    pub fn is_settled(&self) -> bool {
        self.winners.iter().all(|w| w.status == WinnerTransferStatus::Paid)
    }
}

/// Options for `create_payment_request`
#[derive(Debug, Clone, Default)]
pub struct CreatePaymentOptions {
    pub game_id: Option<String>,
    /// Defaults to the configured token
    pub token: Option<Token>,
    pub label: Option<String>,
    pub memo: Option<String>,
}

/// Entry-fee (or other) payment into the escrow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    pub id: String,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    pub payer_wallet: String,
    pub amount: u64,
    pub token: Token,
    pub status: PaymentStatus,
    /// Unique reference key attached to the transfer
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub payment_uri: String,
    /// Encoded presentation of the URI (e.g. a QR payload)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_transfer: Option<ObservedTransfer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<DistributionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRequest {
    /// Move to `next` when legal; returns false and leaves the record untouched otherwise
    pub fn advance(&mut self, next: PaymentStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Treasury cut of `amount` at `percent` (integer, rounds down)
pub fn treasury_fee(amount: u64, percent: u8) -> u64 {
    (amount as u128 * percent.min(100) as u128 / 100) as u64
}

/// Solana Pay style transfer URI
pub fn build_payment_uri(recipient: &str, amount: u64, token: &Token, reference: &str, label: Option<&str>, memo: Option<&str>) -> String {
    let mut uri = format!(
        "solana:{}?amount={}&reference={}",
        recipient,
        token.format_amount(amount),
        reference
    );
    if let Some(ref mint) = token.mint_address {
        uri.push_str(&format!("&spl-token={}", mint));
    }
    if let Some(label) = label {
        uri.push_str(&format!("&label={}", encode_component(label)));
    }
    if let Some(memo) = memo {
        uri.push_str(&format!("&memo={}", encode_component(memo)));
    }
    uri
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

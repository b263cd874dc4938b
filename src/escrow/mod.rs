//! Entry-fee payments into an escrow address

pub mod confirmation;
pub mod ledger;
pub mod manager;
pub mod types;

pub use confirmation::{ConfirmationError, ConfirmationWaiter};
pub use ledger::{AddressSubscription, ConfirmationStatus, LedgerClient, PaymentUriEncoder, WalletResolver};
pub use manager::{PaymentManager, PaymentParts};
pub use types::{CreatePaymentOptions, PaymentRequest, PaymentStatus, RefundOutcome, Token};

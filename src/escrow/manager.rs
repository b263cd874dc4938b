//! Escrow payment lifecycle.
//!
//! Each payment has its own mutex; every transition re-checks the current
//! status under that lock, so duplicate ledger events or a racing expiry
//! never double-transition or double-transfer.

use crate::config::PaymentSettings;
use crate::errors::{ExternalServiceError, LotteryResult, StateConflictError, StorageError, ValidationError};
use crate::escrow::confirmation::{ConfirmationError, ConfirmationWaiter};
use crate::escrow::ledger::{LedgerClient, PaymentUriEncoder, WalletResolver};
use crate::escrow::types::{
    build_payment_uri, treasury_fee, CreatePaymentOptions, DistributionRecord, ObservedTransfer, PaymentRequest,
    PaymentStatus, RefundOutcome, RefundRecord, WinnerTransfer, WinnerTransferStatus, WinningsRecord,
};
use crate::game_store::PaymentStore;
use crate::games::engine::{EntryVerifier, GameSettlement};
use crate::games::types::{EndReason, Payout, UserId};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type PaymentSlot = Arc<Mutex<PaymentRequest>>;
/// Loaded lazily from the store on first use
type WinningsSlot = Arc<Mutex<Option<WinningsRecord>>>;

struct Monitor {
    subscription_id: u64,
    task: JoinHandle<()>,
}

/// External collaborators of the manager
pub struct PaymentParts {
    pub ledger: Arc<dyn LedgerClient>,
    pub wallets: Arc<dyn WalletResolver>,
    pub encoder: Arc<dyn PaymentUriEncoder>,
    pub store: Arc<dyn PaymentStore>,
}

struct ManagerInner {
    settings: PaymentSettings,
    ledger: Arc<dyn LedgerClient>,
    wallets: Arc<dyn WalletResolver>,
    encoder: Arc<dyn PaymentUriEncoder>,
    store: Arc<dyn PaymentStore>,
    waiter: ConfirmationWaiter,
    payments: DashMap<String, PaymentSlot>,
    /// At most one per payment id
    monitors: DashMap<String, Monitor>,
    expiry: DashMap<String, JoinHandle<()>>,
    /// Confirmation and distribution work in flight
    tasks: DashMap<String, JoinHandle<()>>,
    /// Transaction signature -> payment it was matched to
    claimed: DashMap<String, String>,
    /// Game id -> prize transfers
    winnings: DashMap<String, WinningsSlot>,
}

#[derive(Clone)]
pub struct PaymentManager {
    inner: Arc<ManagerInner>,
}

impl PaymentManager {
    pub fn new(settings: PaymentSettings, parts: PaymentParts) -> Self {
        let waiter = ConfirmationWaiter::new(
            parts.ledger.clone(),
            Duration::from_millis(settings.confirmation_poll_ms),
            Duration::from_secs(settings.confirmation_timeout_secs),
        );
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                ledger: parts.ledger,
                wallets: parts.wallets,
                encoder: parts.encoder,
                store: parts.store,
                waiter,
                payments: DashMap::new(),
                monitors: DashMap::new(),
                expiry: DashMap::new(),
                tasks: DashMap::new(),
                claimed: DashMap::new(),
                winnings: DashMap::new(),
            }),
        }
    }

    fn payment_slot(&self, payment_id: &str) -> LotteryResult<PaymentSlot> {
        self.inner
            .payments
            .get(payment_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| ValidationError::PaymentNotFound(payment_id.to_string()).into())
    }

    fn persist(&self, payment: &PaymentRequest) {
        if let Err(e) = self.inner.store.save_payment(payment) {
            tracing::warn!(payment_id = %payment.id, status = %payment.status, "Failed to persist payment: {}", e);
        }
    }

    fn persist_winnings(&self, record: &WinningsRecord) {
        if let Err(e) = self.inner.store.save_winnings(record) {
            tracing::warn!(game_id = %record.game_id, "Failed to persist winnings: {}", e);
        }
    }

    /// Payments bound to `game_id`, oldest first
    async fn game_payments(&self, game_id: &str) -> Vec<PaymentRequest> {
        let slots: Vec<PaymentSlot> = self.inner.payments.iter().map(|entry| entry.value().clone()).collect();
        let mut bound = Vec::new();
        for slot in slots {
            let payment = slot.lock().await;
            if payment.game_id.as_deref() == Some(game_id) {
                bound.push(payment.clone());
            }
        }
        bound.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        bound
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.monitors.len()
    }

    /// Open an entry-fee payment and start watching the escrow for it
    pub async fn create_payment_request(
        &self,
        user_id: UserId,
        amount: u64,
        options: CreatePaymentOptions,
    ) -> LotteryResult<PaymentRequest> {
        if amount == 0 {
            return Err(ValidationError::InvalidAmount(amount).into());
        }

        let payer_wallet = self
            .inner
            .wallets
            .primary_wallet(user_id)
            .await?
            .ok_or(ValidationError::WalletNotLinked { user_id })?;

        let settings = &self.inner.settings;
        let token = options.token.unwrap_or_else(|| settings.token.clone());
        let reference = hex::encode(rand::random::<[u8; 32]>());
        let payment_uri = build_payment_uri(
            &settings.escrow_address,
            amount,
            &token,
            &reference,
            options.label.as_deref(),
            options.memo.as_deref(),
        );

        let timeout = Duration::from_secs(settings.payment_timeout_minutes * 60);
        let now = Utc::now();
        let mut payment = PaymentRequest {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            game_id: options.game_id,
            payer_wallet,
            amount,
            token,
            status: PaymentStatus::Initiated,
            reference,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
            payment_uri,
            presentation: None,
            observed_transfer: None,
            signature: None,
            confirmations: 0,
            distribution: None,
            refund: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.persist(&payment);

        match self.inner.encoder.encode(&payment.payment_uri).await {
            Ok(encoded) => payment.presentation = Some(encoded),
            Err(e) => tracing::warn!(payment_id = %payment.id, "Payment URI encoding failed: {}", e),
        }
        payment.advance(PaymentStatus::AwaitingPayment);
        self.persist(&payment);

        let payment_id = payment.id.clone();
        self.inner
            .payments
            .insert(payment_id.clone(), Arc::new(Mutex::new(payment.clone())));
        self.start_monitor(&payment_id)?;
        self.arm_expiry(&payment_id, timeout);

        tracing::info!(
            payment_id = %payment_id,
            user_id,
            amount,
            token = %payment.token.symbol,
            "Payment request created"
        );
        Ok(payment)
    }

    /// Subscribe to escrow activity for this payment; a no-op when already watching
    fn start_monitor(&self, payment_id: &str) -> LotteryResult<()> {
        let Entry::Vacant(vacant) = self.inner.monitors.entry(payment_id.to_string()) else {
            return Ok(());
        };

        let mut subscription = self.inner.ledger.subscribe_address(&self.inner.settings.escrow_address)?;
        let subscription_id = subscription.id;
        let manager = self.clone();
        let id = payment_id.to_string();

        // The vacant entry keeps the shard locked until the handle is stored
        let task = tokio::spawn(async move {
            while let Some(transfer) = subscription.receiver.recv().await {
                match manager.on_transfer_observed(&id, transfer).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(payment_id = %id, "Transfer handling failed: {}", e),
                }
            }
            manager.release_monitor(&id);
        });

        vacant.insert(Monitor { subscription_id, task });
        tracing::debug!(payment_id, subscription_id, "Escrow monitor started");
        Ok(())
    }

    /// Drop the monitor entry and unsubscribe without aborting its task
    fn release_monitor(&self, payment_id: &str) -> Option<JoinHandle<()>> {
        let (_, monitor) = self.inner.monitors.remove(payment_id)?;
        self.inner.ledger.unsubscribe(monitor.subscription_id);
        tracing::debug!(payment_id, "Escrow monitor stopped");
        Some(monitor.task)
    }

    fn stop_monitor(&self, payment_id: &str) {
        if let Some(task) = self.release_monitor(payment_id) {
            task.abort();
        }
    }

    fn arm_expiry(&self, payment_id: &str, delay: Duration) {
        let manager = self.clone();
        let id = payment_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.inner.expiry.remove(&id);
            if let Err(e) = manager.expire_payment(&id).await {
                tracing::warn!(payment_id = %id, "Expiry failed: {}", e);
            }
        });
        if let Some(previous) = self.inner.expiry.insert(payment_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_expiry(&self, payment_id: &str) {
        if let Some((_, task)) = self.inner.expiry.remove(payment_id) {
            task.abort();
        }
    }

    fn spawn_task<F>(&self, payment_id: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.inner.tasks.insert(payment_id.to_string(), tokio::spawn(work)) {
            previous.abort();
        }
    }

    /// Match a transfer seen on the escrow against one payment.
    ///
    /// Returns whether the transfer was accepted for it.
    pub async fn on_transfer_observed(&self, payment_id: &str, transfer: ObservedTransfer) -> LotteryResult<bool> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;

        if payment.status != PaymentStatus::AwaitingPayment || payment.is_expired_at(Utc::now()) {
            return Ok(false);
        }
        let tolerance = self.inner.settings.amount_tolerance;
        if transfer.from != payment.payer_wallet
            || transfer.mint_address != payment.token.mint_address
            || transfer.amount.abs_diff(payment.amount) > tolerance
        {
            tracing::trace!(payment_id, signature = %transfer.signature, "Transfer does not match payment");
            return Ok(false);
        }

        match self.inner.claimed.entry(transfer.signature.clone()) {
            Entry::Occupied(owner) => {
                tracing::warn!(
                    payment_id,
                    signature = %transfer.signature,
                    claimed_by = %owner.get(),
                    "Transfer already matched to another payment"
                );
                return Ok(false);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(payment_id.to_string());
            }
        }

        let signature = transfer.signature.clone();
        payment.signature = Some(signature.clone());
        payment.observed_transfer = Some(transfer);
        payment.advance(PaymentStatus::Confirming);
        self.persist(&payment);
        drop(payment);

        // Unsubscribing closes the feed, which ends the monitor task
        self.release_monitor(payment_id);
        self.cancel_expiry(payment_id);
        self.spawn_confirmation(payment_id, signature.clone());
        tracing::info!(payment_id, %signature, "Escrow transfer matched");
        Ok(true)
    }

    fn spawn_confirmation(&self, payment_id: &str, signature: String) {
        let manager = self.clone();
        let id = payment_id.to_string();
        let threshold = self.inner.settings.confirmation_threshold;
        self.spawn_task(payment_id, async move {
            let result = manager.inner.waiter.wait_for_confirmation(&signature, threshold).await;
            if let Err(e) = manager.finish_confirmation(&id, result).await {
                tracing::warn!(payment_id = %id, "Confirmation handling failed: {}", e);
            }
        });
    }

    async fn finish_confirmation(
        &self,
        payment_id: &str,
        result: Result<u32, ConfirmationError>,
    ) -> LotteryResult<()> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;
        if payment.status != PaymentStatus::Confirming {
            return Ok(());
        }

        match result {
            Ok(confirmations) => {
                payment.confirmations = confirmations;
                payment.advance(PaymentStatus::Confirmed);
                self.persist(&payment);
                drop(payment);
                tracing::info!(payment_id, confirmations, "Payment confirmed");
                self.process_treasury_distribution(payment_id).await?;
            }
            Err(e) => {
                let error = ExternalServiceError::from(e);
                tracing::warn!(payment_id, "Payment confirmation failed: {}", error);
                payment.last_error = Some(error.to_string());
                payment.advance(PaymentStatus::Failed);
                self.persist(&payment);
            }
        }
        Ok(())
    }

    /// Move the treasury cut out of the escrow. One attempt; failure is terminal.
    pub async fn process_treasury_distribution(&self, payment_id: &str) -> LotteryResult<DistributionRecord> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;

        if !payment.advance(PaymentStatus::Distributing) {
            return Err(StateConflictError::InvalidPaymentTransition {
                payment_id: payment_id.to_string(),
                operation: "distribute",
                status: payment.status.to_string(),
            }
            .into());
        }
        self.persist(&payment);

        let received = payment.observed_transfer.as_ref().map_or(payment.amount, |t| t.amount);
        let fee = treasury_fee(received, self.inner.settings.treasury_fee_percent);
        let transfer = if fee > 0 {
            self.inner
                .ledger
                .send_tokens(&self.inner.settings.treasury_address, fee, &payment.token)
                .await
                .map(Some)
        } else {
            Ok(None)
        };

        match transfer {
            Ok(treasury_signature) => {
                let record = DistributionRecord {
                    fee,
                    net_amount: received - fee,
                    treasury_signature,
                    distributed_at: Utc::now(),
                };
                payment.distribution = Some(record.clone());
                payment.advance(PaymentStatus::Completed);
                self.persist(&payment);
                tracing::info!(payment_id, fee, net_amount = record.net_amount, "Treasury fee distributed");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(payment_id, fee, "Treasury distribution failed: {}", e);
                payment.last_error = Some(e.to_string());
                payment.advance(PaymentStatus::Failed);
                self.persist(&payment);
                Err(e)
            }
        }
    }

    /// Expire a payment still waiting for its transfer; returns the resulting status
    pub async fn expire_payment(&self, payment_id: &str) -> LotteryResult<PaymentStatus> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;

        if payment.advance(PaymentStatus::Expired) {
            self.persist(&payment);
            tracing::info!(payment_id, "Payment expired");
        }
        let status = payment.status;
        drop(payment);

        if status == PaymentStatus::Expired {
            self.stop_monitor(payment_id);
            self.cancel_expiry(payment_id);
        }
        Ok(status)
    }

    pub async fn check_payment_status(&self, payment_id: &str) -> LotteryResult<PaymentRequest> {
        if let Some(slot) = self.inner.payments.get(payment_id).map(|slot| slot.clone()) {
            return Ok(slot.lock().await.clone());
        }
        self.inner
            .store
            .load_payment(payment_id)?
            .ok_or_else(|| ValidationError::PaymentNotFound(payment_id.to_string()).into())
    }

    /// Refund a completed payment to the payer.
    ///
    /// Without an approver (and without auto-approval) the request is only recorded.
    pub async fn process_refund(
        &self,
        payment_id: &str,
        reason: &str,
        approver: Option<UserId>,
    ) -> LotteryResult<RefundOutcome> {
        let approved = approver.is_some() || self.inner.settings.auto_approve_refunds;
        self.refund(payment_id, reason, approver, approved).await
    }

    async fn refund(
        &self,
        payment_id: &str,
        reason: &str,
        approver: Option<UserId>,
        approved: bool,
    ) -> LotteryResult<RefundOutcome> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;

        match payment.status {
            PaymentStatus::Refunded => {
                return Err(StateConflictError::AlreadyRefunded {
                    payment_id: payment_id.to_string(),
                }
                .into());
            }
            PaymentStatus::Completed => {}
            status => {
                return Err(StateConflictError::InvalidPaymentTransition {
                    payment_id: payment_id.to_string(),
                    operation: "refund",
                    status: status.to_string(),
                }
                .into());
            }
        }

        let requested_at = payment.refund.as_ref().map_or_else(Utc::now, |r| r.requested_at);
        if !approved {
            payment.refund = Some(RefundRecord {
                reason: reason.to_string(),
                requested_at,
                approved_by: None,
                signature: None,
                refunded_at: None,
            });
            payment.updated_at = Utc::now();
            self.persist(&payment);
            tracing::info!(payment_id, reason, "Refund awaiting approval");
            return Ok(RefundOutcome::PendingApproval);
        }

        let signature = match self
            .inner
            .ledger
            .send_tokens(&payment.payer_wallet, payment.amount, &payment.token)
            .await
        {
            Ok(signature) => signature,
            Err(e) => {
                tracing::error!(payment_id, "Refund transfer failed: {}", e);
                payment.last_error = Some(e.to_string());
                payment.updated_at = Utc::now();
                self.persist(&payment);
                return Err(e);
            }
        };

        payment.refund = Some(RefundRecord {
            reason: reason.to_string(),
            requested_at,
            approved_by: approver,
            signature: Some(signature.clone()),
            refunded_at: Some(Utc::now()),
        });
        payment.advance(PaymentStatus::Refunded);
        self.persist(&payment);
        tracing::info!(payment_id, %signature, approved_by = ?approver, "Payment refunded");
        Ok(RefundOutcome::Refunded { signature })
    }

    /// Refund every completed entry bound to a game that was cancelled.
    ///
    /// The cancellation itself is the approval. Returns how many payments were refunded.
    pub async fn refund_game_entries(&self, game_id: &str, reason: &str) -> LotteryResult<usize> {
        let mut refunded = 0;
        for payment in self.game_payments(game_id).await {
            if payment.status != PaymentStatus::Completed {
                tracing::warn!(
                    payment_id = %payment.id,
                    game_id,
                    status = %payment.status,
                    "Entry of cancelled game not refundable yet"
                );
                continue;
            }
            match self.refund(&payment.id, reason, None, true).await {
                Ok(RefundOutcome::Refunded { .. }) => refunded += 1,
                Ok(RefundOutcome::PendingApproval) => {}
                Err(e) => tracing::error!(payment_id = %payment.id, game_id, "Entry refund failed: {}", e),
            }
        }
        Ok(refunded)
    }

    /// Pay each survivor's share of a finished paid game out of the escrow.
    ///
    /// Paid winners are skipped on a repeat call and failed ones are retried. A
    /// winner left in SENDING (crash during the transfer) is never retried.
    pub async fn distribute_winnings(&self, game_id: &str, payout: &Payout) -> LotteryResult<WinningsRecord> {
        let slot = self.inner.winnings.entry(game_id.to_string()).or_default().clone();
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = self.inner.store.load_winnings(game_id)?;
        }
        if guard.is_none() {
            let token = self
                .game_payments(game_id)
                .await
                .first()
                .map_or_else(|| self.inner.settings.token.clone(), |p| p.token.clone());
            let now = Utc::now();
            let record = WinningsRecord {
                game_id: game_id.to_string(),
                token,
                prize_per_survivor: payout.prize_per_survivor,
                winners: payout
                    .survivors
                    .iter()
                    .map(|&user_id| WinnerTransfer {
                        user_id,
                        amount: payout.prize_per_survivor,
                        status: WinnerTransferStatus::Pending,
                        wallet: None,
                        signature: None,
                        last_error: None,
                        paid_at: None,
                    })
                    .collect(),
                created_at: now,
                updated_at: now,
            };
            self.persist_winnings(&record);
            *guard = Some(record);
        }
        let Some(record) = guard.as_mut() else {
            return Err(StorageError::ReadFailed(format!("winnings record for {} missing", game_id)).into());
        };

        let token = record.token.clone();
        for i in 0..record.winners.len() {
            let (user_id, amount) = match record.winners[i].status {
                WinnerTransferStatus::Paid | WinnerTransferStatus::Sending => continue,
                WinnerTransferStatus::Pending | WinnerTransferStatus::Failed => {
                    (record.winners[i].user_id, record.winners[i].amount)
                }
            };

            let wallet = match self.inner.wallets.primary_wallet(user_id).await {
                Ok(Some(wallet)) => wallet,
                Ok(None) => {
                    let winner = &mut record.winners[i];
                    winner.status = WinnerTransferStatus::Failed;
                    winner.last_error = Some(ValidationError::WalletNotLinked { user_id }.to_string());
                    tracing::warn!(game_id, user_id, "Winner has no linked wallet");
                    continue;
                }
                Err(e) => {
                    let winner = &mut record.winners[i];
                    winner.status = WinnerTransferStatus::Failed;
                    winner.last_error = Some(e.to_string());
                    tracing::warn!(game_id, user_id, "Winner wallet lookup failed: {}", e);
                    continue;
                }
            };

            if amount == 0 {
                let winner = &mut record.winners[i];
                winner.wallet = Some(wallet);
                winner.status = WinnerTransferStatus::Paid;
                winner.paid_at = Some(Utc::now());
                continue;
            }

            record.winners[i].wallet = Some(wallet.clone());
            record.winners[i].status = WinnerTransferStatus::Sending;
            record.updated_at = Utc::now();
            self.persist_winnings(record);

            let sent = self.inner.ledger.send_tokens(&wallet, amount, &token).await;
            let winner = &mut record.winners[i];
            match sent {
                Ok(signature) => {
                    tracing::info!(game_id, user_id, amount, %signature, "Prize sent");
                    winner.status = WinnerTransferStatus::Paid;
                    winner.signature = Some(signature);
                    winner.last_error = None;
                    winner.paid_at = Some(Utc::now());
                }
                Err(e) => {
                    tracing::error!(game_id, user_id, amount, "Prize transfer failed: {}", e);
                    winner.status = WinnerTransferStatus::Failed;
                    winner.last_error = Some(e.to_string());
                }
            }
            record.updated_at = Utc::now();
            self.persist_winnings(record);
        }

        record.updated_at = Utc::now();
        self.persist_winnings(record);
        Ok(record.clone())
    }

    /// Reload persisted payments and resume whatever each one was waiting on.
    ///
    /// Returns how many payments had work re-armed.
    pub async fn recover(&self) -> LotteryResult<usize> {
        let payments = self.inner.store.load_payments()?;
        let mut resumed = 0;

        for payment in payments {
            let payment_id = payment.id.clone();
            if let Some(ref signature) = payment.signature {
                self.inner.claimed.insert(signature.clone(), payment_id.clone());
            }
            let status = payment.status;
            let signature = payment.signature.clone();
            let expires_at = payment.expires_at;
            let slot = Arc::new(Mutex::new(payment));
            self.inner.payments.insert(payment_id.clone(), slot.clone());

            match status {
                PaymentStatus::Initiated | PaymentStatus::AwaitingPayment => {
                    let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        let mut payment = slot.lock().await;
                        payment.advance(PaymentStatus::AwaitingPayment);
                        payment.advance(PaymentStatus::Expired);
                        self.persist(&payment);
                        continue;
                    }
                    {
                        let mut payment = slot.lock().await;
                        if payment.advance(PaymentStatus::AwaitingPayment) {
                            self.persist(&payment);
                        }
                    }
                    self.start_monitor(&payment_id)?;
                    self.arm_expiry(&payment_id, remaining);
                }
                PaymentStatus::Confirming => match signature {
                    Some(signature) => self.spawn_confirmation(&payment_id, signature),
                    None => {
                        let mut payment = slot.lock().await;
                        payment.last_error = Some("confirming without a transaction signature".to_string());
                        payment.advance(PaymentStatus::Failed);
                        self.persist(&payment);
                        continue;
                    }
                },
                PaymentStatus::Confirmed => {
                    let manager = self.clone();
                    let id = payment_id.clone();
                    self.spawn_task(&payment_id, async move {
                        if let Err(e) = manager.process_treasury_distribution(&id).await {
                            tracing::warn!(payment_id = %id, "Distribution after recovery failed: {}", e);
                        }
                    });
                }
                PaymentStatus::Distributing => {
                    // The treasury transfer may or may not have gone out; never send it twice
                    let mut payment = slot.lock().await;
                    payment.last_error = Some("interrupted during treasury distribution".to_string());
                    payment.advance(PaymentStatus::Failed);
                    self.persist(&payment);
                    tracing::warn!(payment_id = %payment_id, "Payment interrupted mid-distribution, marked failed");
                    continue;
                }
                _ => continue,
            }
            resumed += 1;
        }

        tracing::info!(resumed, total = self.inner.payments.len(), "Payments recovered");
        Ok(resumed)
    }

    /// Stop every monitor and background task
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.inner.monitors.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop_monitor(&id);
        }
        self.inner.expiry.retain(|_, task| {
            task.abort();
            false
        });
        self.inner.tasks.retain(|_, task| {
            task.abort();
            false
        });
    }
}

#[async_trait]
impl EntryVerifier for PaymentManager {
    /// Accept a confirmed payment of at least `min_amount` by `user_id`, binding it to `game_id`
    async fn verify_entry(&self, payment_id: &str, user_id: UserId, game_id: &str, min_amount: u64) -> LotteryResult<()> {
        let slot = self.payment_slot(payment_id)?;
        let mut payment = slot.lock().await;

        let reject = |reason: String| -> LotteryResult<()> {
            Err(ValidationError::PaymentNotAccepted {
                payment_id: payment_id.to_string(),
                reason,
            }
            .into())
        };

        if payment.user_id != user_id {
            return reject("payment belongs to another user".to_string());
        }
        if !matches!(
            payment.status,
            PaymentStatus::Confirmed | PaymentStatus::Distributing | PaymentStatus::Completed
        ) {
            return reject(format!("payment is {}", payment.status));
        }
        let received = payment.observed_transfer.as_ref().map_or(payment.amount, |t| t.amount);
        if received.saturating_add(self.inner.settings.amount_tolerance) < min_amount {
            return reject(format!("paid {} but the entry fee is {}", received, min_amount));
        }
        match payment.game_id {
            Some(ref bound) if bound != game_id => return reject("payment is bound to another game".to_string()),
            Some(_) => {}
            None => {
                payment.game_id = Some(game_id.to_string());
                payment.updated_at = Utc::now();
                self.persist(&payment);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GameSettlement for PaymentManager {
    async fn pay_winners(&self, game_id: &str, payout: &Payout) -> LotteryResult<()> {
        let record = self.distribute_winnings(game_id, payout).await?;
        if record.is_settled() {
            return Ok(());
        }
        let unpaid = record
            .winners
            .iter()
            .filter(|w| w.status != WinnerTransferStatus::Paid)
            .count();
        Err(ExternalServiceError::Ledger(format!("{} of {} prizes unpaid for game {}", unpaid, record.winners.len(), game_id)).into())
    }

    async fn refund_entrants(&self, game_id: &str, reason: EndReason) -> LotteryResult<usize> {
        self.refund_game_entries(game_id, &format!("game cancelled ({})", reason)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LotteryConfig;
    use crate::errors::LotteryError;
    use crate::escrow::ledger::ConfirmationStatus;
    use crate::game_store::MemoryStore;
    use crate::testing::{MockLedger, PlainUriEncoder, StaticWalletResolver};

    const PAYER: &str = "PayerWallet11111111111111111111111111111111";

    struct Harness {
        manager: PaymentManager,
        ledger: Arc<MockLedger>,
        store: Arc<MemoryStore>,
        settings: PaymentSettings,
    }

    fn harness_with(settings: PaymentSettings, store: Arc<MemoryStore>) -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let manager = PaymentManager::new(
            settings.clone(),
            PaymentParts {
                ledger: ledger.clone(),
                wallets: Arc::new(StaticWalletResolver::new().with_wallet(42, PAYER)),
                encoder: Arc::new(PlainUriEncoder::new()),
                store: store.clone(),
            },
        );
        Harness {
            manager,
            ledger,
            store,
            settings,
        }
    }

    fn harness() -> Harness {
        harness_with(LotteryConfig::testing().payment, Arc::new(MemoryStore::new()))
    }

    fn transfer(h: &Harness, signature: &str, amount: u64) -> ObservedTransfer {
        ObservedTransfer {
            signature: signature.to_string(),
            from: PAYER.to_string(),
            to: h.settings.escrow_address.clone(),
            amount,
            mint_address: None,
            observed_at: Utc::now(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_payment_request() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 1_000_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        assert_eq!(payment.status, PaymentStatus::AwaitingPayment);
        assert!(payment.payment_uri.starts_with(&format!("solana:{}", h.settings.escrow_address)));
        assert!(payment.payment_uri.contains(&payment.reference));
        assert_eq!(payment.presentation.as_deref(), Some(payment.payment_uri.as_str()));
        assert_eq!(h.manager.monitor_count(), 1);
        assert_eq!(h.ledger.subscription_count(), 1);
        assert!(h.store.load_payment(&payment.id).expect("load").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlinked_wallet_rejected() {
        let h = harness();
        let err = h
            .manager
            .create_payment_request(7, 1_000, CreatePaymentOptions::default())
            .await
            .expect_err("no wallet");
        assert!(matches!(
            err,
            LotteryError::Validation(ValidationError::WalletNotLinked { user_id: 7 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matched_transfer_completes_with_treasury_fee() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 1_000_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        h.ledger.set_status("sig-ok", ConfirmationStatus::Pending { confirmations: 5 });
        assert_eq!(h.ledger.push_transfer(&h.settings.escrow_address, transfer(&h, "sig-ok", 1_000_000)), 1);
        settle().await;

        let done = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(done.status, PaymentStatus::Completed);
        assert_eq!(done.confirmations, 5);
        let distribution = done.distribution.expect("distribution");
        assert_eq!(distribution.fee, 100_000);
        assert_eq!(distribution.net_amount, 900_000);

        let sent = h.ledger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, h.settings.treasury_address);
        assert_eq!(sent[0].amount, 100_000);
        assert_eq!(h.manager.monitor_count(), 0);
        assert_eq!(h.ledger.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_transfer_then_expiry() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 1_000_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        let mut stranger = transfer(&h, "sig-x", 1_000_000);
        stranger.from = "SomeoneElse".to_string();
        h.ledger.push_transfer(&h.settings.escrow_address, stranger);
        h.ledger.push_transfer(&h.settings.escrow_address, transfer(&h, "sig-y", 999_999));
        settle().await;
        assert_eq!(
            h.manager.check_payment_status(&payment.id).await.expect("status").status,
            PaymentStatus::AwaitingPayment
        );

        tokio::time::sleep(Duration::from_secs(h.settings.payment_timeout_minutes * 60)).await;
        let expired = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(expired.status, PaymentStatus::Expired);
        assert_eq!(h.manager.monitor_count(), 0);

        // Expiry is a no-op once terminal
        assert_eq!(h.manager.expire_payment(&payment.id).await.expect("expire"), PaymentStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signature_matches_only_one_payment() {
        let h = harness();
        let first = h
            .manager
            .create_payment_request(42, 500, CreatePaymentOptions::default())
            .await
            .expect("create");
        let second = h
            .manager
            .create_payment_request(42, 500, CreatePaymentOptions::default())
            .await
            .expect("create");

        let t = transfer(&h, "sig-shared", 500);
        assert!(h.manager.on_transfer_observed(&first.id, t.clone()).await.expect("first"));
        assert!(!h.manager.on_transfer_observed(&second.id, t.clone()).await.expect("second"));
        assert!(!h.manager.on_transfer_observed(&first.id, t).await.expect("duplicate"));

        assert_eq!(
            h.manager.check_payment_status(&second.id).await.expect("status").status,
            PaymentStatus::AwaitingPayment
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_failure_fails_payment() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 500, CreatePaymentOptions::default())
            .await
            .expect("create");

        h.ledger.set_status(
            "sig-bad",
            ConfirmationStatus::Failed {
                reason: "blockhash expired".to_string(),
            },
        );
        h.manager
            .on_transfer_observed(&payment.id, transfer(&h, "sig-bad", 500))
            .await
            .expect("observe");
        settle().await;

        let failed = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.last_error.expect("error").contains("blockhash expired"));
        assert!(h.ledger.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribution_failure_is_terminal() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 1_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        h.ledger.fail_sends(true);
        h.ledger.set_status("sig-d", ConfirmationStatus::Finalized);
        h.manager
            .on_transfer_observed(&payment.id, transfer(&h, "sig-d", 1_000))
            .await
            .expect("observe");
        settle().await;

        let failed = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.last_error.is_some());
        assert!(h.manager.process_treasury_distribution(&payment.id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_flow() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 2_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        let early = h.manager.process_refund(&payment.id, "changed mind", Some(1)).await;
        assert!(matches!(
            early,
            Err(LotteryError::StateConflict(StateConflictError::InvalidPaymentTransition { .. }))
        ));

        h.ledger.set_status("sig-r", ConfirmationStatus::Finalized);
        h.manager
            .on_transfer_observed(&payment.id, transfer(&h, "sig-r", 2_000))
            .await
            .expect("observe");
        settle().await;

        let pending = h.manager.process_refund(&payment.id, "game cancelled", None).await.expect("request");
        assert_eq!(pending, RefundOutcome::PendingApproval);
        let recorded = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(recorded.status, PaymentStatus::Completed);
        assert!(recorded.refund.is_some());

        let refunded = h.manager.process_refund(&payment.id, "game cancelled", Some(1)).await.expect("refund");
        assert!(matches!(refunded, RefundOutcome::Refunded { .. }));
        let last = h.ledger.sent().pop().expect("refund transfer");
        assert_eq!(last.to, PAYER);
        assert_eq!(last.amount, 2_000);

        let again = h.manager.process_refund(&payment.id, "again", Some(1)).await;
        assert!(matches!(
            again,
            Err(LotteryError::StateConflict(StateConflictError::AlreadyRefunded { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_entry_binds_game() {
        let h = harness();
        let payment = h
            .manager
            .create_payment_request(42, 1_000, CreatePaymentOptions::default())
            .await
            .expect("create");

        assert!(h.manager.verify_entry(&payment.id, 42, "game-a", 1_000).await.is_err(), "not paid yet");

        h.ledger.set_status("sig-e", ConfirmationStatus::Finalized);
        h.manager
            .on_transfer_observed(&payment.id, transfer(&h, "sig-e", 1_000))
            .await
            .expect("observe");
        settle().await;

        assert!(h.manager.verify_entry(&payment.id, 43, "game-a", 1_000).await.is_err(), "wrong user");
        assert!(h.manager.verify_entry(&payment.id, 42, "game-a", 5_000).await.is_err(), "underpaid");
        h.manager.verify_entry(&payment.id, 42, "game-a", 1_000).await.expect("accepted");
        assert!(h.manager.verify_entry(&payment.id, 42, "game-b", 1_000).await.is_err(), "reused");
        assert_eq!(
            h.manager.check_payment_status(&payment.id).await.expect("status").game_id.as_deref(),
            Some("game-a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_resumes_persisted_work() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_with(LotteryConfig::testing().payment, store.clone());
        let awaiting = first
            .manager
            .create_payment_request(42, 1_000, CreatePaymentOptions::default())
            .await
            .expect("create");
        let mut confirmed = awaiting.clone();
        confirmed.id = "confirmed-payment".to_string();
        confirmed.status = PaymentStatus::Confirmed;
        store.save_payment(&confirmed).expect("save");
        first.manager.shutdown();

        let second = harness_with(LotteryConfig::testing().payment, store);
        let resumed = second.manager.recover().await.expect("recover");
        assert_eq!(resumed, 2);
        assert_eq!(second.manager.monitor_count(), 1);

        settle().await;
        assert_eq!(
            second.manager.check_payment_status("confirmed-payment").await.expect("status").status,
            PaymentStatus::Completed
        );
    }

    /// Payment store whose writes always fail
    struct FullDiskStore;

    impl PaymentStore for FullDiskStore {
        fn save_payment(&self, _payment: &PaymentRequest) -> LotteryResult<()> {
            Err(StorageError::WriteFailed("disk full".to_string()).into())
        }

        fn load_payment(&self, _payment_id: &str) -> LotteryResult<Option<PaymentRequest>> {
            Ok(None)
        }

        fn load_payments(&self) -> LotteryResult<Vec<PaymentRequest>> {
            Ok(Vec::new())
        }

        fn save_winnings(&self, _record: &WinningsRecord) -> LotteryResult<()> {
            Err(StorageError::WriteFailed("disk full".to_string()).into())
        }

        fn load_winnings(&self, _game_id: &str) -> LotteryResult<Option<WinningsRecord>> {
            Ok(None)
        }
    }

    async fn completed_payment(h: &Harness, amount: u64, game_id: Option<&str>, signature: &str) -> PaymentRequest {
        let payment = h
            .manager
            .create_payment_request(
                42,
                amount,
                CreatePaymentOptions {
                    game_id: game_id.map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        h.ledger.set_status(signature, ConfirmationStatus::Finalized);
        h.manager
            .on_transfer_observed(&payment.id, transfer(h, signature, amount))
            .await
            .expect("observe");
        settle().await;
        let done = h.manager.check_payment_status(&payment.id).await.expect("status");
        assert_eq!(done.status, PaymentStatus::Completed);
        done
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_payment_request_survives_store_failure() {
        let ledger = Arc::new(MockLedger::new());
        let settings = LotteryConfig::testing().payment;
        let manager = PaymentManager::new(
            settings.clone(),
            PaymentParts {
                ledger: ledger.clone(),
                wallets: Arc::new(StaticWalletResolver::new().with_wallet(42, PAYER)),
                encoder: Arc::new(PlainUriEncoder::new()),
                store: Arc::new(FullDiskStore),
            },
        );

        let payment = manager
            .create_payment_request(42, 1_000, CreatePaymentOptions::default())
            .await
            .expect("in-memory operation continues");
        assert_eq!(payment.status, PaymentStatus::AwaitingPayment);
        assert_eq!(manager.monitor_count(), 1);
        assert_eq!(
            manager.check_payment_status(&payment.id).await.expect("status").status,
            PaymentStatus::AwaitingPayment
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribute_winnings_pays_each_survivor_once() {
        let h = harness();
        completed_payment(&h, 1_000_000, Some("game-w"), "sig-entry").await;
        let treasury_sends = h.ledger.sent().len();

        let payout = Payout {
            survivors: vec![42, 7],
            prize_per_survivor: 450_000,
            remainder: 0,
        };
        let record = h.manager.distribute_winnings("game-w", &payout).await.expect("distribute");
        assert_eq!(record.winners.len(), 2);
        assert!(!record.is_settled(), "user 7 has no wallet");
        assert_eq!(record.winners[0].status, WinnerTransferStatus::Paid);
        assert_eq!(record.winners[0].wallet.as_deref(), Some(PAYER));
        assert_eq!(record.winners[1].status, WinnerTransferStatus::Failed);

        let prizes: Vec<_> = h.ledger.sent().into_iter().skip(treasury_sends).collect();
        assert_eq!(prizes.len(), 1);
        assert_eq!(prizes[0].to, PAYER);
        assert_eq!(prizes[0].amount, 450_000);
        assert_eq!(Some(prizes[0].signature.clone()), record.winners[0].signature);

        // A repeat call retries the failed winner but never re-pays the first
        let again = h.manager.distribute_winnings("game-w", &payout).await.expect("repeat");
        assert_eq!(again.winners[0].signature, record.winners[0].signature);
        assert_eq!(h.ledger.sent().len(), treasury_sends + 1);
        assert_eq!(h.store.load_winnings("game-w").expect("load"), Some(again));

        let err = h.manager.pay_winners("game-w", &payout).await.expect_err("one prize unpaid");
        assert!(err.to_string().contains("1 of 2 prizes unpaid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_prize_transfer_is_not_resent() {
        let h = harness();
        let mut record = WinningsRecord {
            game_id: "game-crash".to_string(),
            token: h.settings.token.clone(),
            prize_per_survivor: 900,
            winners: vec![WinnerTransfer {
                user_id: 42,
                amount: 900,
                status: WinnerTransferStatus::Sending,
                wallet: Some(PAYER.to_string()),
                signature: None,
                last_error: None,
                paid_at: None,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.store.save_winnings(&record).expect("save");

        let payout = Payout {
            survivors: vec![42],
            prize_per_survivor: 900,
            remainder: 0,
        };
        let loaded = h.manager.distribute_winnings("game-crash", &payout).await.expect("distribute");
        record.updated_at = loaded.updated_at;
        assert_eq!(loaded, record);
        assert!(h.ledger.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_game_refunds_completed_entries() {
        let h = harness();
        let paid = completed_payment(&h, 2_000, Some("game-c"), "sig-c").await;
        let unpaid = h
            .manager
            .create_payment_request(
                42,
                2_000,
                CreatePaymentOptions {
                    game_id: Some("game-c".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("create");
        completed_payment(&h, 3_000, Some("other-game"), "sig-o").await;

        let refunded = h
            .manager
            .refund_entrants("game-c", EndReason::InsufficientPlayers)
            .await
            .expect("refund");
        assert_eq!(refunded, 1, "refund needs no approver when the game is cancelled");

        let record = h.manager.check_payment_status(&paid.id).await.expect("status");
        assert_eq!(record.status, PaymentStatus::Refunded);
        let refund = record.refund.expect("refund record");
        assert!(refund.reason.contains("not enough players"));
        assert!(refund.signature.is_some());

        let last = h.ledger.sent().pop().expect("refund transfer");
        assert_eq!((last.to.as_str(), last.amount), (PAYER, 2_000));
        assert_eq!(
            h.manager.check_payment_status(&unpaid.id).await.expect("status").status,
            PaymentStatus::AwaitingPayment
        );
        assert_eq!(h.manager.refund_game_entries("game-c", "again").await.expect("repeat"), 0);
    }
}

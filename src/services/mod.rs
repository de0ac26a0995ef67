//! Services module for payment business logic

pub mod ledger;
pub mod notification;
pub mod reconciliation;
pub mod subscription;

pub use ledger::{Disposition, LedgerError, LedgerUpdate, PaymentLedger};
pub use notification::{LogNotifier, Notifier};
pub use reconciliation::{
    InitiatePayment, InitiatedPayment, ReconciliationCoordinator, ReconciliationError,
    RedirectPages, RedirectTarget, StatusCheck, SweepReport, WebhookOutcome,
};
pub use subscription::SubscriptionExtender;

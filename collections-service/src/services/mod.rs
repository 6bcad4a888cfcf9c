pub mod database;
pub mod due_queue;
pub mod email;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod reconciler;
pub mod repository;
pub mod scheduler;
pub mod stripe;
pub mod templates;

pub use database::Database;
pub use due_queue::{DueQueue, MockDueQueue, RedisDueQueue};
pub use email::{EmailMessage, EmailSender, MockEmailSender, SmtpEmailSender};
pub use ledger::InvoiceLedger;
pub use metrics::{get_metrics, init_metrics};
pub use pricing::{price, PricingEngine, RateSheet};
pub use reconciler::{PaymentReconciler, WebhookOutcome};
pub use repository::{
    InvoiceRepository, MockRepository, MutationOutcome, ProcessedEvent, RequestRepository,
};
pub use scheduler::{
    should_send_follow_up, BatchReport, FollowUpPolicy, FollowUpScheduler, ScheduleEmailRequest,
    SchedulerHandle,
};
pub use stripe::{MockPaymentProvider, PaymentProvider, StripeClient};

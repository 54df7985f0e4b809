pub mod dedupe;
pub mod outbox;
pub mod provider_status;
pub mod resend;
pub mod retention;
pub mod signal;
pub mod store;

pub use outbox::{EnqueueOptions, Outbox};
pub use resend::{AutoResendScanner, ResendManager, ScanReport};
pub use retention::{RetentionSweep, SweepReport};
pub use signal::{SignalReceiver, TransportSignal, Wakeup};
pub use store::{MemoryOutboxStore, OutboxStore, PgOutboxStore, StoreSettings};

pub mod direct;
pub mod render;
pub mod sender;
pub mod worker;

pub use direct::{DirectDelivery, DirectError, DirectOutcome};
pub use render::{PlainTextRenderer, RenderError, RenderedMessage, TemplateRenderer};
pub use sender::{LogSender, OutgoingEmail, ResendSender, SendError, Sender};
pub use worker::{AttemptPolicy, BurstOutcome, DispatchWorker, DrainReport};

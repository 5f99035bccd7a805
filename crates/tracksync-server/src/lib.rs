pub mod actor;
pub mod executor;
pub mod subscriptions;

pub use actor::{Actor, ActorState, Dispatcher, MAX_CONCURRENT_RUNS, SHUTDOWN_TIMEOUT};
pub use executor::SequenceExecutor;
pub use subscriptions::{SubscriptionManager, WebhookHandler};

pub mod serve;
pub mod subscriptions;
pub mod ticket;
pub mod validate;
pub mod webhooks;

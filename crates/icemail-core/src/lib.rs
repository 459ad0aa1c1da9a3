//! icemail Core - mail intake, conditional delivery and query construction
//!
//! This crate holds the decision logic of the gateway: the whitelist
//! matcher, the intake pipeline, the delivery activator, the query builder,
//! the outbound transport and the inbound SMTP listener that feeds intake.

pub mod delivery;
pub mod intake;
pub mod query;
pub mod smtp;
pub mod transport;
pub mod whitelist;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use delivery::DeliveryActivator;
pub use intake::IntakePipeline;
pub use query::{EmailRecord, FieldsResponse, QueryBuilder, SearchRequest, SearchResponse};
pub use smtp::{MessageHandler, SmtpServer};
pub use transport::{SmtpRelay, Transport};
pub use whitelist::Whitelist;

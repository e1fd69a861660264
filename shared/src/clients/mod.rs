//! Collaborator interfaces consumed by the order/inventory core. Transport
//! details stay behind the traits so the pipeline can be exercised against
//! in-process fakes.

pub mod auth;
pub mod catalog;
pub mod payment;

pub use auth::{JwtVerifier, TokenIdentity, TokenVerifier};
pub use catalog::{Book, CatalogClient, HttpCatalogClient};
pub use payment::{MockPaymentGateway, PaymentClient, PaymentOutcome};

//! Shared domain types for the Apothecary storefront.
//!
//! Everything in this crate is pure: no database, no HTTP. The web
//! application in the root crate persists these types and enforces the
//! transitions defined here.

pub mod commission;
pub mod pagination;
pub mod slug;
pub mod status;

pub use commission::{CommissionTier, commission_amount, select_rate};
pub use pagination::{Page, Pagination};
pub use slug::slugify;
pub use status::{CommissionStatus, OrderStatus, PaymentMethod, PaymentStatus};

use thiserror::Error;

/// Errors produced by the pure domain helpers.
#[derive(Debug, Error, PartialEq)]
pub enum CommonError {
    #[error("Cannot derive a slug from '{0}'")]
    EmptySlug(String),

    #[error("Invalid {kind}: {value}")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Commission rate {0} bps is out of range (0..=10000)")]
    RateOutOfRange(u32),
}

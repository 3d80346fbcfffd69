//! Typed error hierarchy for the storefront.
//!
//! `ShopError` carries the domain failures the HTTP layer needs to tell
//! apart. The database layer returns `anyhow::Result` and raises these via
//! `ShopError::into()`, so handlers can downcast to pick a status code.

use apothecary_common::{CommonError, OrderStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShopError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Insufficient stock for '{product}': {available} available")]
    InsufficientStock { product: String, available: i64 },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl ShopError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_entity_and_id() {
        let err = ShopError::not_found("Product", "tra-gung");
        assert_eq!(err.to_string(), "Product tra-gung not found");
    }

    #[test]
    fn invalid_transition_renders_statuses() {
        let err = ShopError::InvalidTransition {
            from: OrderStatus::Delivered,
            to: OrderStatus::Pending,
        };
        assert_eq!(err.to_string(), "Cannot move order from delivered to pending");
    }

    #[test]
    fn shop_error_survives_anyhow_round_trip() {
        let err: anyhow::Error = ShopError::Unauthorized.into();
        let err = err.context("while loading cart");
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Unauthorized)
        ));
    }

    #[test]
    fn common_error_converts() {
        let err: ShopError = CommonError::RateOutOfRange(20_000).into();
        assert!(matches!(err, ShopError::Common(CommonError::RateOutOfRange(20_000))));
    }
}

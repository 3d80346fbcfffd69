use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::ShopDb;
use crate::errors::ShopError;
use crate::shop::models::*;

impl ShopDb {
    // ── Cart ──────────────────────────────────────────────────────────

    pub fn get_cart(&self, user_id: i64) -> Result<CartView> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id, p.name, p.slug, p.images, COALESCE(p.sale_price, p.price),
                        c.quantity, p.stock
                 FROM cart_items c JOIN products p ON p.id = c.product_id
                 WHERE c.user_id = ?1
                 ORDER BY c.id",
            )
            .context("Failed to prepare get_cart")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .context("Failed to query cart")?;

        let mut lines = Vec::new();
        for row in rows {
            let (product_id, name, slug, images, unit_price, quantity, stock) =
                row.context("Failed to read cart row")?;
            let images: Vec<String> =
                serde_json::from_str(&images).context("Failed to parse product images JSON")?;
            lines.push(CartLine {
                product_id,
                name,
                slug,
                image: images.into_iter().next(),
                unit_price,
                quantity,
                line_total: unit_price * quantity,
                stock,
            });
        }

        let item_count = lines.iter().map(|l| l.quantity).sum();
        let subtotal = lines.iter().map(|l| l.line_total).sum();
        Ok(CartView {
            lines,
            item_count,
            subtotal,
        })
    }

    /// Add `quantity` of a product, on top of what the cart already holds.
    pub fn add_to_cart(&self, user_id: i64, product_id: i64, quantity: i64) -> Result<CartView> {
        if quantity < 1 {
            return Err(ShopError::Validation("quantity must be at least 1".into()).into());
        }
        let existing = self.cart_quantity(user_id, product_id)?;
        let total = existing
            .checked_add(quantity)
            .ok_or_else(|| ShopError::Validation("quantity is too large".into()))?;
        self.check_purchasable(product_id, total)?;
        self.conn
            .execute(
                "INSERT INTO cart_items (user_id, product_id, quantity) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, product_id) DO UPDATE SET quantity = quantity + excluded.quantity",
                params![user_id, product_id, quantity],
            )
            .context("Failed to add cart item")?;
        self.get_cart(user_id)
    }

    /// Replace the quantity of a line; zero removes it.
    pub fn set_cart_quantity(&self, user_id: i64, product_id: i64, quantity: i64) -> Result<CartView> {
        if quantity < 0 {
            return Err(ShopError::Validation("quantity must not be negative".into()).into());
        }
        if quantity == 0 {
            return self.remove_from_cart(user_id, product_id);
        }
        if self.cart_quantity(user_id, product_id)? == 0 {
            return Err(ShopError::not_found("Cart item", product_id).into());
        }
        self.check_purchasable(product_id, quantity)?;
        self.conn
            .execute(
                "UPDATE cart_items SET quantity = ?1 WHERE user_id = ?2 AND product_id = ?3",
                params![quantity, user_id, product_id],
            )
            .context("Failed to update cart item")?;
        self.get_cart(user_id)
    }

    pub fn remove_from_cart(&self, user_id: i64, product_id: i64) -> Result<CartView> {
        self.conn
            .execute(
                "DELETE FROM cart_items WHERE user_id = ?1 AND product_id = ?2",
                params![user_id, product_id],
            )
            .context("Failed to remove cart item")?;
        self.get_cart(user_id)
    }

    pub fn clear_cart(&self, user_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM cart_items WHERE user_id = ?1", params![user_id])
            .context("Failed to clear cart")?;
        Ok(())
    }

    fn cart_quantity(&self, user_id: i64, product_id: i64) -> Result<i64> {
        let quantity = self
            .conn
            .query_row(
                "SELECT quantity FROM cart_items WHERE user_id = ?1 AND product_id = ?2",
                params![user_id, product_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cart item")?;
        Ok(quantity.unwrap_or(0))
    }

    /// The product exists, is on sale, and has `quantity` units in stock.
    fn check_purchasable(&self, product_id: i64, quantity: i64) -> Result<()> {
        let product = self
            .get_product(product_id)?
            .ok_or_else(|| ShopError::not_found("Product", product_id))?;
        if product.status != ProductStatus::Active {
            return Err(ShopError::Validation(format!(
                "Product '{}' is not available",
                product.name
            ))
            .into());
        }
        if quantity > product.stock {
            return Err(ShopError::InsufficientStock {
                product: product.name,
                available: product.stock,
            }
            .into());
        }
        Ok(())
    }
}

use std::str::FromStr;

use anyhow::{Context, Result};
use apothecary_common::{OrderStatus, Page, Pagination, PaymentMethod, PaymentStatus};
use rusqlite::{OptionalExtension, Row, params};

use super::{Filter, ShopDb, is_unique_violation, like_pattern};
use crate::errors::ShopError;
use crate::shop::models::*;

const ORDER_COLUMNS: &str = "id, order_code, user_id, status, shipping_name, shipping_phone, \
     shipping_address, note, subtotal, total, payment_method, payment_status, affiliate_link_id, \
     created_at, updated_at";

struct OrderRow {
    id: i64,
    order_code: String,
    user_id: i64,
    status: String,
    shipping_name: String,
    shipping_phone: String,
    shipping_address: String,
    note: String,
    subtotal: i64,
    total: i64,
    payment_method: String,
    payment_status: String,
    affiliate_link_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl OrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_code: row.get(1)?,
            user_id: row.get(2)?,
            status: row.get(3)?,
            shipping_name: row.get(4)?,
            shipping_phone: row.get(5)?,
            shipping_address: row.get(6)?,
            note: row.get(7)?,
            subtotal: row.get(8)?,
            total: row.get(9)?,
            payment_method: row.get(10)?,
            payment_status: row.get(11)?,
            affiliate_link_id: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_order(self) -> Result<Order> {
        Ok(Order {
            id: self.id,
            order_code: self.order_code,
            user_id: self.user_id,
            status: OrderStatus::from_str(&self.status).context("Failed to parse order status")?,
            shipping_name: self.shipping_name,
            shipping_phone: self.shipping_phone,
            shipping_address: self.shipping_address,
            note: self.note,
            subtotal: self.subtotal,
            total: self.total,
            payment_method: PaymentMethod::from_str(&self.payment_method)
                .context("Failed to parse payment method")?,
            payment_status: PaymentStatus::from_str(&self.payment_status)
                .context("Failed to parse payment status")?,
            affiliate_link_id: self.affiliate_link_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    let unit_price: i64 = row.get(4)?;
    let quantity: i64 = row.get(5)?;
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        product_id: row.get(2)?,
        product_name: row.get(3)?,
        unit_price,
        quantity,
        line_total: unit_price * quantity,
    })
}

/// `ORD-<yyyymmdd>-<6 hex>`, e.g. `ORD-20261015-3FA9C1`.
fn new_order_code() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("ORD-{}-{}", chrono::Utc::now().format("%Y%m%d"), suffix)
}

fn require_field(value: &str, field: &str) -> Result<String, ShopError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ShopError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

impl ShopDb {
    // ── Checkout ──────────────────────────────────────────────────────

    /// Turn the user's cart into an order.
    ///
    /// Stock, cart, payment and affiliate attribution change together or
    /// not at all.
    pub fn checkout(
        &self,
        user_id: i64,
        input: CheckoutInput,
        ref_code: Option<&str>,
    ) -> Result<OrderDetail> {
        let shipping_name = require_field(&input.shipping_name, "shipping_name")?;
        let shipping_phone = require_field(&input.shipping_phone, "shipping_phone")?;
        let shipping_address = require_field(&input.shipping_address, "shipping_address")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let cart = self.get_cart(user_id)?;
        if cart.lines.is_empty() {
            return Err(ShopError::Validation("Cart is empty".into()).into());
        }
        for line in &cart.lines {
            let product = self
                .get_product(line.product_id)?
                .ok_or_else(|| ShopError::not_found("Product", line.product_id))?;
            if product.status != ProductStatus::Active {
                return Err(ShopError::Validation(format!(
                    "Product '{}' is no longer available",
                    product.name
                ))
                .into());
            }
            if line.quantity > product.stock {
                return Err(ShopError::InsufficientStock {
                    product: product.name,
                    available: product.stock,
                }
                .into());
            }
        }

        let subtotal = cart.subtotal;
        let total = subtotal;
        let mut attempts = 0;
        let order_id = loop {
            let code = new_order_code();
            let result = tx.execute(
                "INSERT INTO orders (order_code, user_id, shipping_name, shipping_phone,
                     shipping_address, note, subtotal, total, payment_method)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    code,
                    user_id,
                    shipping_name,
                    shipping_phone,
                    shipping_address,
                    input.note.trim(),
                    subtotal,
                    total,
                    input.payment_method.as_str()
                ],
            );
            match result {
                Ok(_) => break tx.last_insert_rowid(),
                Err(e) if is_unique_violation(&e) && attempts < 3 => attempts += 1,
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert order")),
            }
        };

        for line in &cart.lines {
            tx.execute(
                "INSERT INTO order_items (order_id, product_id, product_name, unit_price, quantity)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![order_id, line.product_id, line.name, line.unit_price, line.quantity],
            )
            .context("Failed to insert order item")?;
            tx.execute(
                "UPDATE products SET stock = stock - ?1, updated_at = datetime('now') WHERE id = ?2",
                params![line.quantity, line.product_id],
            )
            .context("Failed to decrement stock")?;
        }
        tx.execute(
            "INSERT INTO payments (order_id, method, amount) VALUES (?1, ?2, ?3)",
            params![order_id, input.payment_method.as_str(), total],
        )
        .context("Failed to insert payment")?;
        self.clear_cart(user_id)?;
        self.attribute_order(order_id, user_id, total, ref_code)?;

        tx.commit().context("Failed to commit checkout")?;

        self.get_order_detail(order_id)?
            .context("Order not found after checkout")
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_order(&self, id: i64) -> Result<Option<Order>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
                params![id],
                OrderRow::from_row,
            )
            .optional()
            .context("Failed to query order")?;
        row.map(OrderRow::into_order).transpose()
    }

    pub fn get_order_detail(&self, id: i64) -> Result<Option<OrderDetail>> {
        let order = match self.get_order(id)? {
            Some(order) => order,
            None => return Ok(None),
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, order_id, product_id, product_name, unit_price, quantity
                 FROM order_items WHERE order_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare order items query")?;
        let items = stmt
            .query_map(params![id], item_from_row)
            .context("Failed to query order items")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read order item row")?;

        Ok(Some(OrderDetail {
            payment: self.get_payment(id)?,
            commission: self.get_commission_for_order(id)?,
            order,
            items,
        }))
    }

    pub fn get_payment(&self, order_id: i64) -> Result<Option<Payment>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, order_id, method, status, amount, paid_at, created_at
                 FROM payments WHERE order_id = ?1",
                params![order_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query payment")?;
        match row {
            Some((id, order_id, method, status, amount, paid_at, created_at)) => Ok(Some(Payment {
                id,
                order_id,
                method: PaymentMethod::from_str(&method).context("Failed to parse payment method")?,
                status: PaymentStatus::from_str(&status).context("Failed to parse payment status")?,
                amount,
                paid_at,
                created_at,
            })),
            None => Ok(None),
        }
    }

    pub fn list_orders(&self, filter: &OrderFilter, pagination: Pagination) -> Result<Page<Order>> {
        let mut where_ = Filter::default();
        if let Some(uid) = filter.user_id {
            where_.push("user_id = ?", uid);
        }
        if let Some(status) = filter.status {
            where_.push("status = ?", status.as_str().to_string());
        }
        if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
            where_.push_repeated(
                "(order_code LIKE ? ESCAPE '\\' OR shipping_name LIKE ? ESCAPE '\\' \
                 OR shipping_phone LIKE ? ESCAPE '\\')",
                like_pattern(q),
            );
        }

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM orders{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count orders")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders{} ORDER BY id DESC LIMIT ? OFFSET ?",
                where_.where_sql()
            ))
            .context("Failed to prepare list_orders")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                OrderRow::from_row,
            )
            .context("Failed to query orders")?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row.context("Failed to read order row")?.into_order()?);
        }
        Ok(Page::new(orders, total, pagination))
    }

    // ── Status changes ────────────────────────────────────────────────

    /// Customer-initiated cancellation; only a pending order of their own.
    pub fn cancel_own_order(&self, user_id: i64, order_id: i64) -> Result<OrderTransition> {
        match self.get_order(order_id)? {
            Some(order) if order.user_id == user_id => {
                if order.status != OrderStatus::Pending {
                    return Err(ShopError::InvalidTransition {
                        from: order.status,
                        to: OrderStatus::Cancelled,
                    }
                    .into());
                }
                self.update_order_status(order_id, OrderStatus::Cancelled)
            }
            _ => Err(ShopError::not_found("Order", order_id).into()),
        }
    }

    /// Move an order along its lifecycle and apply the side effects:
    /// cancelling restores stock and cancels the commission, delivering
    /// approves the commission and settles cash-on-delivery payments.
    pub fn update_order_status(&self, order_id: i64, next: OrderStatus) -> Result<OrderTransition> {
        let order = self
            .get_order(order_id)?
            .ok_or_else(|| ShopError::not_found("Order", order_id))?;
        let from = order.status;
        if !from.can_transition_to(next) {
            return Err(ShopError::InvalidTransition { from, to: next }.into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE orders SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![next.as_str(), order_id],
        )
        .context("Failed to update order status")?;

        let commission = match next {
            OrderStatus::Cancelled => {
                tx.execute(
                    "UPDATE products SET stock = stock + (
                         SELECT COALESCE(SUM(quantity), 0) FROM order_items
                         WHERE order_items.order_id = ?1 AND order_items.product_id = products.id)
                     WHERE id IN (SELECT product_id FROM order_items WHERE order_id = ?1)",
                    params![order_id],
                )
                .context("Failed to restore stock")?;
                self.cancel_commission_for_order(order_id)?
            }
            OrderStatus::Delivered => {
                if order.payment_method == PaymentMethod::Cod
                    && order.payment_status == PaymentStatus::Pending
                {
                    self.set_payment_status(order_id, PaymentStatus::Paid)?;
                }
                self.approve_commission_for_order(order_id)?
            }
            _ => None,
        };
        tx.commit().context("Failed to commit order status change")?;

        tracing::info!(order_id, %from, to = %next, "Order status changed");
        let order = self
            .get_order(order_id)?
            .context("Order not found after status change")?;
        Ok(OrderTransition {
            order,
            from,
            commission,
        })
    }

    pub fn update_payment_status(&self, order_id: i64, status: PaymentStatus) -> Result<Payment> {
        if self.get_order(order_id)?.is_none() {
            return Err(ShopError::not_found("Order", order_id).into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.set_payment_status(order_id, status)?;
        tx.commit().context("Failed to commit payment update")?;
        self.get_payment(order_id)?
            .ok_or_else(|| ShopError::not_found("Payment", order_id).into())
    }

    /// Payment row and the order's denormalized copy; `paid` stamps `paid_at`.
    fn set_payment_status(&self, order_id: i64, status: PaymentStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE payments SET status = ?1,
                     paid_at = CASE WHEN ?1 = 'paid' THEN COALESCE(paid_at, datetime('now')) ELSE paid_at END
                 WHERE order_id = ?2",
                params![status.as_str(), order_id],
            )
            .context("Failed to update payment")?;
        self.conn
            .execute(
                "UPDATE orders SET payment_status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), order_id],
            )
            .context("Failed to update order payment status")?;
        Ok(())
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    pub fn dashboard_stats(&self) -> Result<DashboardStats> {
        let (orders, pending_orders, revenue): (i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'pending'), 0),
                        COALESCE(SUM(CASE WHEN status = 'delivered' THEN total ELSE 0 END), 0)
                 FROM orders",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to aggregate orders")?;
        let (pending_commissions, approved_commissions): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(CASE WHEN status = 'pending' THEN amount ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'approved' THEN amount ELSE 0 END), 0)
                 FROM commissions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to aggregate commissions")?;

        Ok(DashboardStats {
            users: self.count_users()?,
            products: self.count_products()?,
            orders,
            pending_orders,
            revenue,
            pending_commissions,
            approved_commissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shop::db::test_support;
    use apothecary_common::CommissionStatus;

    struct Fixture {
        db: ShopDb,
        buyer: User,
        product: Product,
    }

    fn fixture() -> Result<Fixture> {
        let db = ShopDb::new_in_memory()?;
        let buyer = test_support::customer(&db, "buyer@example.com")?;
        let product = test_support::active_product(&db, "Trà atiso", 100_000, 10)?;
        Ok(Fixture { db, buyer, product })
    }

    #[test]
    fn test_checkout_snapshots_cart_and_decrements_stock() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 3)?;

        let detail = f.db.checkout(f.buyer.id, test_support::checkout_input(), None)?;
        assert!(detail.order.order_code.starts_with("ORD-"));
        assert_eq!(detail.order.status, OrderStatus::Pending);
        assert_eq!(detail.order.total, 300_000);
        assert_eq!(detail.items.len(), 1);
        assert_eq!(detail.items[0].product_name, "Trà atiso");
        assert_eq!(detail.items[0].line_total, 300_000);
        let payment = detail.payment.expect("payment");
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.amount, 300_000);
        assert!(detail.commission.is_none());

        assert_eq!(f.db.get_product(f.product.id)?.unwrap().stock, 7);
        assert!(f.db.get_cart(f.buyer.id)?.lines.is_empty());
        Ok(())
    }

    #[test]
    fn test_checkout_empty_cart_is_rejected() -> Result<()> {
        let f = fixture()?;
        let err = f
            .db
            .checkout(f.buyer.id, test_support::checkout_input(), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_checkout_rolls_back_when_stock_ran_out() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 5)?;
        f.db.update_product(f.product.id, ProductInput { stock: Some(2), ..Default::default() })?;

        let err = f
            .db
            .checkout(f.buyer.id, test_support::checkout_input(), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::InsufficientStock { .. })
        ));
        assert_eq!(f.db.get_cart(f.buyer.id)?.item_count, 5);
        assert_eq!(
            f.db.list_orders(&OrderFilter::default(), Pagination::default())?.total,
            0
        );
        Ok(())
    }

    #[test]
    fn test_checkout_requires_shipping_fields() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 1)?;
        let mut input = test_support::checkout_input();
        input.shipping_address = "   ".into();
        assert!(f.db.checkout(f.buyer.id, input, None).is_err());
        Ok(())
    }

    #[test]
    fn test_customer_cancel_restores_stock() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 4)?;
        let detail = f.db.checkout(f.buyer.id, test_support::checkout_input(), None)?;

        let other = test_support::customer(&f.db, "other@example.com")?;
        assert!(f.db.cancel_own_order(other.id, detail.order.id).is_err());

        let transition = f.db.cancel_own_order(f.buyer.id, detail.order.id)?;
        assert_eq!(transition.from, OrderStatus::Pending);
        assert_eq!(transition.order.status, OrderStatus::Cancelled);
        assert_eq!(f.db.get_product(f.product.id)?.unwrap().stock, 10);
        Ok(())
    }

    #[test]
    fn test_customer_cannot_cancel_confirmed_order() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 1)?;
        let detail = f.db.checkout(f.buyer.id, test_support::checkout_input(), None)?;
        f.db.update_order_status(detail.order.id, OrderStatus::Confirmed)?;

        let err = f.db.cancel_own_order(f.buyer.id, detail.order.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::InvalidTransition { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_transition_is_rejected() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 1)?;
        let detail = f.db.checkout(f.buyer.id, test_support::checkout_input(), None)?;

        let err = f
            .db
            .update_order_status(detail.order.id, OrderStatus::Delivered)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::InvalidTransition {
                from: OrderStatus::Pending,
                to: OrderStatus::Delivered
            })
        ));
        Ok(())
    }

    #[test]
    fn test_referred_order_lifecycle() -> Result<()> {
        let f = fixture()?;
        let referrer = test_support::collaborator(&f.db, "ref@example.com")?;
        let link = f
            .db
            .create_affiliate_link(referrer.id, AffiliateLinkInput::default(), false)?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 2)?;

        let detail = f
            .db
            .checkout(f.buyer.id, test_support::checkout_input(), Some(&link.code))?;
        assert_eq!(detail.order.affiliate_link_id, Some(link.id));
        let commission = detail.commission.expect("commission");
        assert_eq!(commission.amount, 20_000);
        assert_eq!(commission.status, CommissionStatus::Pending);

        for status in [OrderStatus::Confirmed, OrderStatus::Shipping] {
            f.db.update_order_status(detail.order.id, status)?;
        }
        let delivered = f.db.update_order_status(detail.order.id, OrderStatus::Delivered)?;
        assert_eq!(
            delivered.commission.map(|c| c.status),
            Some(CommissionStatus::Approved)
        );
        assert_eq!(delivered.order.payment_status, PaymentStatus::Paid);
        assert!(f.db.get_payment(detail.order.id)?.unwrap().paid_at.is_some());
        assert_eq!(f.db.get_user(referrer.id)?.unwrap().affiliate_balance, 20_000);

        let stats = f.db.dashboard_stats()?;
        assert_eq!(stats.revenue, 200_000);
        assert_eq!(stats.approved_commissions, 20_000);
        assert_eq!(stats.pending_orders, 0);
        Ok(())
    }

    #[test]
    fn test_admin_payment_update_stamps_paid_at() -> Result<()> {
        let f = fixture()?;
        f.db.add_to_cart(f.buyer.id, f.product.id, 1)?;
        let mut input = test_support::checkout_input();
        input.payment_method = PaymentMethod::BankTransfer;
        let detail = f.db.checkout(f.buyer.id, input, None)?;

        let payment = f.db.update_payment_status(detail.order.id, PaymentStatus::Paid)?;
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert!(payment.paid_at.is_some());
        assert_eq!(
            f.db.get_order(detail.order.id)?.unwrap().payment_status,
            PaymentStatus::Paid
        );
        Ok(())
    }

    #[test]
    fn test_list_orders_filters() -> Result<()> {
        let f = fixture()?;
        for _ in 0..2 {
            f.db.add_to_cart(f.buyer.id, f.product.id, 1)?;
            f.db.checkout(f.buyer.id, test_support::checkout_input(), None)?;
        }
        let page = f.db.list_orders(
            &OrderFilter {
                user_id: Some(f.buyer.id),
                status: Some(OrderStatus::Pending),
                q: Some("0900".into()),
            },
            Pagination::new(Some(1), Some(1)),
        )?;
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total_pages, 2);
        Ok(())
    }
}

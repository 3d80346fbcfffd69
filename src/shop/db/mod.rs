//! SQLite persistence for the storefront.
//!
//! `ShopDb` owns the connection; each submodule adds an `impl ShopDb` block
//! for one feature area. Handlers reach it through `DbHandle::call`, which
//! runs the closure on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use rusqlite::types::Value;

mod affiliate;
mod cart;
mod catalog;
mod orders;
mod posts;
mod settings;
mod users;

pub(crate) use settings::AFFILIATE_KEY;
pub use settings::{HOMEPAGE_KEYS, is_reserved_key};

/// Async-safe handle to the shop database.
///
/// Wraps `ShopDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ShopDb>>,
}

impl DbHandle {
    pub fn new(db: ShopDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ShopDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| anyhow::Error::new(crate::errors::ShopError::LockPoisoned))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and CLI
    /// commands only; never from a request handler.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ShopDb>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::Error::new(crate::errors::ShopError::LockPoisoned))
    }
}

pub struct ShopDb {
    conn: Connection,
}

impl ShopDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    password_hash TEXT NOT NULL,
                    full_name TEXT NOT NULL,
                    phone TEXT,
                    role TEXT NOT NULL DEFAULT 'customer',
                    active INTEGER NOT NULL DEFAULT 1,
                    affiliate_balance INTEGER NOT NULL DEFAULT 0,
                    lifetime_sales INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    image TEXT,
                    parent_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS products (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    sku TEXT,
                    short_description TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    price INTEGER NOT NULL,
                    sale_price INTEGER,
                    stock INTEGER NOT NULL DEFAULT 0,
                    images TEXT NOT NULL DEFAULT '[]',
                    category_id INTEGER REFERENCES categories(id) ON DELETE RESTRICT,
                    status TEXT NOT NULL DEFAULT 'draft',
                    featured INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS post_categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS posts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    excerpt TEXT NOT NULL DEFAULT '',
                    content TEXT NOT NULL DEFAULT '',
                    cover_image TEXT,
                    category_id INTEGER REFERENCES post_categories(id) ON DELETE SET NULL,
                    author_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    status TEXT NOT NULL DEFAULT 'draft',
                    published_at TEXT,
                    view_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cart_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
                    quantity INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, product_id)
                );

                CREATE TABLE IF NOT EXISTS affiliate_links (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL DEFAULT '',
                    product_id INTEGER REFERENCES products(id) ON DELETE SET NULL,
                    category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                    rate_bps INTEGER,
                    clicks INTEGER NOT NULL DEFAULT 0,
                    conversions INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS affiliate_clicks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    link_id INTEGER NOT NULL REFERENCES affiliate_links(id) ON DELETE CASCADE,
                    ip TEXT,
                    user_agent TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_code TEXT NOT NULL UNIQUE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    shipping_name TEXT NOT NULL,
                    shipping_phone TEXT NOT NULL,
                    shipping_address TEXT NOT NULL,
                    note TEXT NOT NULL DEFAULT '',
                    subtotal INTEGER NOT NULL,
                    total INTEGER NOT NULL,
                    payment_method TEXT NOT NULL DEFAULT 'cod',
                    payment_status TEXT NOT NULL DEFAULT 'pending',
                    affiliate_link_id INTEGER REFERENCES affiliate_links(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS order_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    product_id INTEGER REFERENCES products(id) ON DELETE SET NULL,
                    product_name TEXT NOT NULL,
                    unit_price INTEGER NOT NULL,
                    quantity INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS payments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL UNIQUE REFERENCES orders(id) ON DELETE CASCADE,
                    method TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    amount INTEGER NOT NULL,
                    paid_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS payouts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
                    amount INTEGER NOT NULL,
                    commission_count INTEGER NOT NULL,
                    note TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS commissions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE RESTRICT,
                    order_id INTEGER NOT NULL UNIQUE REFERENCES orders(id) ON DELETE CASCADE,
                    link_id INTEGER REFERENCES affiliate_links(id) ON DELETE SET NULL,
                    order_total INTEGER NOT NULL,
                    rate_bps INTEGER NOT NULL,
                    amount INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    payout_id INTEGER REFERENCES payouts(id),
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
                CREATE INDEX IF NOT EXISTS idx_products_status ON products(status);
                CREATE INDEX IF NOT EXISTS idx_posts_status ON posts(status, published_at);
                CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
                CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
                CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
                CREATE INDEX IF NOT EXISTS idx_commissions_user ON commissions(user_id, status);
                CREATE INDEX IF NOT EXISTS idx_affiliate_links_user ON affiliate_links(user_id);
                CREATE INDEX IF NOT EXISTS idx_affiliate_clicks_link ON affiliate_clicks(link_id);
                ",
            )
            .context("Failed to create tables")?;

        // Seed the affiliate program settings once; admins edit them later.
        let defaults = serde_json::to_string(&super::models::AffiliateSettings::default())
            .context("Failed to serialize default affiliate settings")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                rusqlite::params![settings::AFFILIATE_KEY, defaults],
            )
            .context("Failed to seed affiliate settings")?;

        Ok(())
    }
}

// ── Query helpers ─────────────────────────────────────────────────────

/// Accumulates `WHERE` clauses with positional `?` parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Filter {
    fn push(&mut self, clause: &str, value: impl Into<Value>) {
        self.clauses.push(clause.to_string());
        self.values.push(value.into());
    }

    /// Add a clause whose `?` placeholders take the same value.
    fn push_repeated(&mut self, clause: &str, value: impl Into<Value>) {
        let value = value.into();
        let count = clause.matches('?').count();
        self.clauses.push(clause.to_string());
        for _ in 0..count {
            self.values.push(value.clone());
        }
    }

    fn raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn params(&self) -> rusqlite::ParamsFromIter<std::slice::Iter<'_, Value>> {
        rusqlite::params_from_iter(self.values.iter())
    }

    /// Parameters followed by `LIMIT ? OFFSET ?` values.
    fn paged_params(&self, limit: i64, offset: i64) -> Vec<Value> {
        let mut values = self.values.clone();
        values.push(Value::Integer(limit));
        values.push(Value::Integer(offset));
        values
    }
}

/// `%term%` for a `LIKE ? ESCAPE '\\'` search, with the wildcards in `term` escaped.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;

    use super::ShopDb;
    use crate::shop::models::*;

    pub fn customer(db: &ShopDb, email: &str) -> Result<User> {
        db.create_user(email, "hash", "Test Customer", None, Role::Customer)
    }

    pub fn collaborator(db: &ShopDb, email: &str) -> Result<User> {
        db.create_user(email, "hash", "Test Collaborator", None, Role::Collaborator)
    }

    pub fn active_product(db: &ShopDb, name: &str, price: i64, stock: i64) -> Result<Product> {
        db.create_product(ProductInput {
            name: Some(name.to_string()),
            price: Some(price),
            stock: Some(stock),
            status: Some(ProductStatus::Active),
            ..Default::default()
        })
    }

    pub fn checkout_input() -> CheckoutInput {
        CheckoutInput {
            shipping_name: "Nguyen Van A".to_string(),
            shipping_phone: "0900000000".to_string(),
            shipping_address: "12 Hang Bac, Ha Noi".to_string(),
            note: String::new(),
            payment_method: apothecary_common::PaymentMethod::Cod,
        }
    }
}

use std::str::FromStr;

use anyhow::{Context, Result};
use apothecary_common::{Page, Pagination};
use rusqlite::{OptionalExtension, Row, params};

use super::{Filter, ShopDb, is_foreign_key_violation, is_unique_violation, like_pattern};
use crate::errors::ShopError;
use crate::shop::models::*;

const USER_COLUMNS: &str = "id, email, full_name, phone, role, active, affiliate_balance, \
                            lifetime_sales, created_at, updated_at";

struct UserRow {
    id: i64,
    email: String,
    full_name: String,
    phone: Option<String>,
    role: String,
    active: bool,
    affiliate_balance: i64,
    lifetime_sales: i64,
    created_at: String,
    updated_at: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            full_name: row.get(2)?,
            phone: row.get(3)?,
            role: row.get(4)?,
            active: row.get(5)?,
            affiliate_balance: row.get(6)?,
            lifetime_sales: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_user(self) -> Result<User> {
        let role = Role::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse user role")?;
        Ok(User {
            id: self.id,
            email: self.email,
            full_name: self.full_name,
            phone: self.phone,
            role,
            active: self.active,
            affiliate_balance: self.affiliate_balance,
            lifetime_sales: self.lifetime_sales,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ShopDb {
    // ── User CRUD ─────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        full_name: &str,
        phone: Option<&str>,
        role: Role,
    ) -> Result<User> {
        let email = email.trim().to_lowercase();
        let result = self.conn.execute(
            "INSERT INTO users (email, password_hash, full_name, phone, role) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![email, password_hash, full_name.trim(), phone, role.as_str()],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ShopError::Conflict(format!("Email {} is already registered", email)).into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert user")),
        }
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                UserRow::from_row,
            )
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    /// Look up a user and their stored password hash by email.
    pub fn get_user_credentials(&self, email: &str) -> Result<Option<(User, String)>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?1"),
                params![email.trim().to_lowercase()],
                |row| Ok((UserRow::from_row(row)?, row.get::<_, String>(10)?)),
            )
            .optional()
            .context("Failed to query user credentials")?;
        match row {
            Some((user, hash)) => Ok(Some((user.into_user()?, hash))),
            None => Ok(None),
        }
    }

    pub fn get_password_hash(&self, id: i64) -> Result<String> {
        self.conn
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query password hash")?
            .ok_or_else(|| ShopError::not_found("User", id).into())
    }

    pub fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE users SET password_hash = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![password_hash, id],
            )
            .context("Failed to update password")?;
        if count == 0 {
            return Err(ShopError::not_found("User", id).into());
        }
        Ok(())
    }

    pub fn list_users(&self, filter: &UserFilter, pagination: Pagination) -> Result<Page<User>> {
        let mut where_ = Filter::default();
        if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
            where_.push_repeated(
                "(full_name LIKE ? ESCAPE '\\' OR email LIKE ? ESCAPE '\\')",
                like_pattern(q),
            );
        }
        if let Some(role) = filter.role {
            where_.push("role = ?", role.as_str().to_string());
        }

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM users{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count users")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users{} ORDER BY id DESC LIMIT ? OFFSET ?",
                where_.where_sql()
            ))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                UserRow::from_row,
            )
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(Page::new(users, total, pagination))
    }

    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<User> {
        if self.get_user(id)?.is_none() {
            return Err(ShopError::not_found("User", id).into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = patch.full_name.as_deref() {
            if name.trim().is_empty() {
                return Err(ShopError::Validation("full_name must not be empty".into()).into());
            }
            tx.execute(
                "UPDATE users SET full_name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![name.trim(), id],
            )
            .context("Failed to update user name")?;
        }
        if let Some(phone) = patch.phone.as_deref() {
            tx.execute(
                "UPDATE users SET phone = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![phone.trim(), id],
            )
            .context("Failed to update user phone")?;
        }
        if let Some(role) = patch.role {
            tx.execute(
                "UPDATE users SET role = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![role.as_str(), id],
            )
            .context("Failed to update user role")?;
        }
        if let Some(active) = patch.active {
            tx.execute(
                "UPDATE users SET active = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![active, id],
            )
            .context("Failed to update user active flag")?;
        }
        tx.commit().context("Failed to commit user update")?;

        self.get_user(id)?.context("User not found after update")
    }

    /// Delete a user together with their permission list.
    pub fn delete_user(&self, id: i64) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        match tx.execute("DELETE FROM users WHERE id = ?1", params![id]) {
            Ok(count) => {
                if count > 0 {
                    self.delete_setting(&permissions_key(id))?;
                }
                tx.commit().context("Failed to commit user deletion")?;
                Ok(count > 0)
            }
            Err(e) if is_foreign_key_violation(&e) => Err(ShopError::Conflict(format!(
                "User {} has orders or commissions and cannot be deleted; deactivate instead",
                id
            ))
            .into()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to delete user")),
        }
    }

    pub fn count_users(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }

    // ── Permissions ───────────────────────────────────────────────────

    /// Explicit permission list for a user (empty when none stored).
    pub fn get_permissions(&self, user_id: i64) -> Result<Vec<Permission>> {
        match self.get_setting(&permissions_key(user_id))? {
            Some(setting) => serde_json::from_value(setting.value)
                .context("Failed to parse stored permission list"),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_permissions(&self, user_id: i64, permissions: &[Permission]) -> Result<Vec<Permission>> {
        if self.get_user(user_id)?.is_none() {
            return Err(ShopError::not_found("User", user_id).into());
        }
        let mut unique: Vec<Permission> = Vec::new();
        for p in permissions {
            if !unique.contains(p) {
                unique.push(*p);
            }
        }
        let value = serde_json::to_value(&unique).context("Failed to serialize permissions")?;
        self.put_setting(&permissions_key(user_id), &value)?;
        Ok(unique)
    }

    /// Whether `user` may act on `permission` in the back-office.
    pub fn has_permission(&self, user: &User, permission: Permission) -> Result<bool> {
        match user.role {
            Role::Admin => Ok(true),
            Role::Staff => Ok(self.get_permissions(user.id)?.contains(&permission)),
            Role::Collaborator | Role::Customer => Ok(false),
        }
    }
}

pub(crate) fn permissions_key(user_id: i64) -> String {
    format!("{}user:{}", super::settings::PERMISSIONS_PREFIX, user_id)
}

use std::str::FromStr;

use anyhow::{Context, Result};
use apothecary_common::commission::validate_rate;
use apothecary_common::{CommissionStatus, Page, Pagination, commission_amount, select_rate};
use rusqlite::{OptionalExtension, Row, params};

use super::{Filter, ShopDb, is_unique_violation};
use crate::errors::ShopError;
use crate::shop::models::*;

const LINK_COLUMNS: &str = "id, user_id, code, name, product_id, category_id, rate_bps, clicks, \
                            conversions, active, created_at";

const COMMISSION_COLUMNS: &str = "id, user_id, order_id, link_id, order_total, rate_bps, amount, \
                                  status, payout_id, created_at, updated_at";

const CODE_LEN: usize = 8;

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<AffiliateLink> {
    Ok(AffiliateLink {
        id: row.get(0)?,
        user_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        product_id: row.get(4)?,
        category_id: row.get(5)?,
        rate_bps: row.get(6)?,
        clicks: row.get(7)?,
        conversions: row.get(8)?,
        active: row.get(9)?,
        created_at: row.get(10)?,
    })
}

struct CommissionRow {
    id: i64,
    user_id: i64,
    order_id: i64,
    link_id: Option<i64>,
    order_total: i64,
    rate_bps: u32,
    amount: i64,
    status: String,
    payout_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl CommissionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            order_id: row.get(2)?,
            link_id: row.get(3)?,
            order_total: row.get(4)?,
            rate_bps: row.get(5)?,
            amount: row.get(6)?,
            status: row.get(7)?,
            payout_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_commission(self) -> Result<Commission> {
        let status =
            CommissionStatus::from_str(&self.status).context("Failed to parse commission status")?;
        Ok(Commission {
            id: self.id,
            user_id: self.user_id,
            order_id: self.order_id,
            link_id: self.link_id,
            order_total: self.order_total,
            rate_bps: self.rate_bps,
            amount: self.amount,
            status,
            payout_id: self.payout_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn payout_from_row(row: &Row<'_>) -> rusqlite::Result<Payout> {
    Ok(Payout {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        commission_count: row.get(3)?,
        note: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Random lowercase hex code for a new link.
fn new_link_code() -> String {
    let mut code = uuid::Uuid::new_v4().simple().to_string();
    code.truncate(CODE_LEN);
    code
}

impl ShopDb {
    // ── Links ─────────────────────────────────────────────────────────

    /// Create a link owned by `user_id`. `may_set_rate` is false for
    /// collaborators, who cannot pick their own commission rate.
    pub fn create_affiliate_link(
        &self,
        user_id: i64,
        input: AffiliateLinkInput,
        may_set_rate: bool,
    ) -> Result<AffiliateLink> {
        let owner = self
            .get_user(user_id)?
            .ok_or_else(|| ShopError::not_found("User", user_id))?;
        if !owner.role.can_refer() {
            return Err(ShopError::Forbidden(format!(
                "Role '{}' cannot own affiliate links",
                owner.role
            ))
            .into());
        }
        let product_id = input.product_id.flatten();
        let category_id = input.category_id.flatten();
        check_link_rate(input.rate_bps, may_set_rate)?;
        let rate_bps = input.rate_bps.flatten();
        self.check_link_target(product_id, category_id)?;

        let name = input.name.unwrap_or_default();
        let mut attempts = 0;
        loop {
            let code = new_link_code();
            let result = self.conn.execute(
                "INSERT INTO affiliate_links (user_id, code, name, product_id, category_id, rate_bps, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user_id,
                    code,
                    name.trim(),
                    product_id,
                    category_id,
                    rate_bps,
                    input.active.unwrap_or(true)
                ],
            );
            match result {
                Ok(_) => break,
                Err(e) if is_unique_violation(&e) && attempts < 3 => attempts += 1,
                Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert affiliate link")),
            }
        }
        let id = self.conn.last_insert_rowid();
        self.get_affiliate_link(id)?
            .context("Affiliate link not found after insert")
    }

    pub fn get_affiliate_link(&self, id: i64) -> Result<Option<AffiliateLink>> {
        self.conn
            .query_row(
                &format!("SELECT {LINK_COLUMNS} FROM affiliate_links WHERE id = ?1"),
                params![id],
                link_from_row,
            )
            .optional()
            .context("Failed to query affiliate link")
    }

    pub fn get_affiliate_link_by_code(&self, code: &str) -> Result<Option<AffiliateLink>> {
        self.conn
            .query_row(
                &format!("SELECT {LINK_COLUMNS} FROM affiliate_links WHERE code = ?1"),
                params![code],
                link_from_row,
            )
            .optional()
            .context("Failed to query affiliate link by code")
    }

    /// Links of one owner, or every link when `user_id` is `None`.
    pub fn list_affiliate_links(&self, user_id: Option<i64>) -> Result<Vec<AffiliateLink>> {
        let mut where_ = Filter::default();
        if let Some(uid) = user_id {
            where_.push("user_id = ?", uid);
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LINK_COLUMNS} FROM affiliate_links{} ORDER BY id DESC",
                where_.where_sql()
            ))
            .context("Failed to prepare list_affiliate_links")?;
        let rows = stmt
            .query_map(where_.params(), link_from_row)
            .context("Failed to query affiliate links")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read affiliate link row")
    }

    pub fn update_affiliate_link(
        &self,
        id: i64,
        input: AffiliateLinkInput,
        may_set_rate: bool,
    ) -> Result<AffiliateLink> {
        let current = self
            .get_affiliate_link(id)?
            .ok_or_else(|| ShopError::not_found("Affiliate link", id))?;
        let product_id = input.product_id.unwrap_or(current.product_id);
        let category_id = input.category_id.unwrap_or(current.category_id);
        self.check_link_target(product_id, category_id)?;
        check_link_rate(input.rate_bps, may_set_rate)?;
        let rate_bps = input.rate_bps.unwrap_or(current.rate_bps);

        self.conn
            .execute(
                "UPDATE affiliate_links SET name = ?1, product_id = ?2, category_id = ?3,
                     rate_bps = ?4, active = ?5
                 WHERE id = ?6",
                params![
                    input.name.as_deref().map(str::trim).unwrap_or(&current.name),
                    product_id,
                    category_id,
                    rate_bps,
                    input.active.unwrap_or(current.active),
                    id
                ],
            )
            .context("Failed to update affiliate link")?;
        self.get_affiliate_link(id)?
            .context("Affiliate link not found after update")
    }

    pub fn delete_affiliate_link(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM affiliate_links WHERE id = ?1", params![id])
            .context("Failed to delete affiliate link")?;
        Ok(count > 0)
    }

    fn check_link_target(&self, product_id: Option<i64>, category_id: Option<i64>) -> Result<()> {
        if product_id.is_some() && category_id.is_some() {
            return Err(ShopError::Validation(
                "A link targets either a product or a category, not both".into(),
            )
            .into());
        }
        if let Some(pid) = product_id {
            self.get_product(pid)?
                .ok_or_else(|| ShopError::not_found("Product", pid))?;
        }
        if let Some(cid) = category_id {
            self.get_category(cid)?
                .ok_or_else(|| ShopError::not_found("Category", cid))?;
        }
        Ok(())
    }

    // ── Click tracking ────────────────────────────────────────────────

    /// Record a click on `code` and resolve where it lands. `None` when the
    /// code is unknown, the link is inactive, or the program is switched off.
    pub fn record_click(
        &self,
        code: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<ClickRedirect>> {
        if !self.affiliate_settings()?.enabled {
            return Ok(None);
        }
        let link = match self.get_affiliate_link_by_code(code)? {
            Some(link) if link.active => link,
            _ => return Ok(None),
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO affiliate_clicks (link_id, ip, user_agent) VALUES (?1, ?2, ?3)",
            params![link.id, ip, user_agent],
        )
        .context("Failed to insert click")?;
        tx.execute(
            "UPDATE affiliate_links SET clicks = clicks + 1 WHERE id = ?1",
            params![link.id],
        )
        .context("Failed to increment clicks")?;
        tx.commit().context("Failed to commit click")?;

        let location = if let Some(pid) = link.product_id {
            self.get_product(pid)?
                .map(|p| format!("/products/{}", p.slug))
        } else if let Some(cid) = link.category_id {
            self.get_category(cid)?
                .map(|c| format!("/categories/{}", c.slug))
        } else {
            None
        };

        Ok(Some(ClickRedirect {
            link_id: link.id,
            location: location.unwrap_or_else(|| "/".to_string()),
        }))
    }

    // ── Commissions ───────────────────────────────────────────────────

    /// Credit the owner of `ref_code` for a freshly placed order.
    ///
    /// Runs inside the checkout transaction. Returns `None` when the program
    /// is off, the code does not name an active link, or the buyer owns it.
    pub(crate) fn attribute_order(
        &self,
        order_id: i64,
        buyer_id: i64,
        order_total: i64,
        ref_code: Option<&str>,
    ) -> Result<Option<Commission>> {
        let Some(code) = ref_code.filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let settings = self.affiliate_settings()?;
        if !settings.enabled {
            return Ok(None);
        }
        let link = match self.get_affiliate_link_by_code(code)? {
            Some(link) if link.active && link.user_id != buyer_id => link,
            _ => return Ok(None),
        };
        let owner = self
            .get_user(link.user_id)?
            .ok_or_else(|| ShopError::not_found("User", link.user_id))?;
        if !owner.active {
            return Ok(None);
        }

        let rate_bps = link.rate_bps.unwrap_or_else(|| {
            select_rate(&settings.tiers, owner.lifetime_sales, settings.base_rate_bps)
        });
        let amount = commission_amount(order_total, rate_bps);

        self.conn
            .execute(
                "UPDATE affiliate_links SET conversions = conversions + 1 WHERE id = ?1",
                params![link.id],
            )
            .context("Failed to increment conversions")?;
        self.conn
            .execute(
                "UPDATE orders SET affiliate_link_id = ?1 WHERE id = ?2",
                params![link.id, order_id],
            )
            .context("Failed to tag order with affiliate link")?;
        self.conn
            .execute(
                "INSERT INTO commissions (user_id, order_id, link_id, order_total, rate_bps, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![owner.id, order_id, link.id, order_total, rate_bps, amount],
            )
            .context("Failed to insert commission")?;

        tracing::info!(
            order_id,
            link = %link.code,
            referrer = owner.id,
            rate_bps,
            amount,
            "Attributed order to affiliate"
        );
        self.get_commission_for_order(order_id)
    }

    pub fn get_commission_for_order(&self, order_id: i64) -> Result<Option<Commission>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {COMMISSION_COLUMNS} FROM commissions WHERE order_id = ?1"),
                params![order_id],
                CommissionRow::from_row,
            )
            .optional()
            .context("Failed to query commission")?;
        row.map(CommissionRow::into_commission).transpose()
    }

    /// Approve the pending commission of a delivered order and credit the
    /// referrer. Runs inside the caller's transaction.
    pub(crate) fn approve_commission_for_order(&self, order_id: i64) -> Result<Option<Commission>> {
        let commission = match self.get_commission_for_order(order_id)? {
            Some(c) if c.status.can_transition_to(CommissionStatus::Approved) => c,
            _ => return Ok(None),
        };
        self.set_commission_status(commission.id, CommissionStatus::Approved)?;
        self.conn
            .execute(
                "UPDATE users SET affiliate_balance = affiliate_balance + ?1,
                     lifetime_sales = lifetime_sales + ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![commission.amount, commission.order_total, commission.user_id],
            )
            .context("Failed to credit referrer")?;
        self.get_commission_for_order(order_id)
    }

    /// Cancel the commission of a cancelled order. An approved commission
    /// is taken back out of the referrer's balance.
    pub(crate) fn cancel_commission_for_order(&self, order_id: i64) -> Result<Option<Commission>> {
        let commission = match self.get_commission_for_order(order_id)? {
            Some(c) if c.status.can_transition_to(CommissionStatus::Cancelled) => c,
            _ => return Ok(None),
        };
        self.set_commission_status(commission.id, CommissionStatus::Cancelled)?;
        if commission.status == CommissionStatus::Approved {
            self.conn
                .execute(
                    "UPDATE users SET affiliate_balance = affiliate_balance - ?1,
                         lifetime_sales = MAX(lifetime_sales - ?2, 0), updated_at = datetime('now')
                     WHERE id = ?3",
                    params![commission.amount, commission.order_total, commission.user_id],
                )
                .context("Failed to debit referrer")?;
        }
        self.get_commission_for_order(order_id)
    }

    fn set_commission_status(&self, id: i64, status: CommissionStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE commissions SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update commission status")?;
        Ok(())
    }

    pub fn list_commissions(
        &self,
        filter: &CommissionFilter,
        pagination: Pagination,
    ) -> Result<Page<Commission>> {
        let mut where_ = Filter::default();
        if let Some(status) = filter.status {
            where_.push("status = ?", status.as_str().to_string());
        }
        if let Some(uid) = filter.user_id {
            where_.push("user_id = ?", uid);
        }

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM commissions{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count commissions")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {COMMISSION_COLUMNS} FROM commissions{} ORDER BY id DESC LIMIT ? OFFSET ?",
                where_.where_sql()
            ))
            .context("Failed to prepare list_commissions")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                CommissionRow::from_row,
            )
            .context("Failed to query commissions")?;
        let mut commissions = Vec::new();
        for row in rows {
            commissions.push(row.context("Failed to read commission row")?.into_commission()?);
        }
        Ok(Page::new(commissions, total, pagination))
    }

    // ── Payouts ───────────────────────────────────────────────────────

    /// Settle every approved commission of `user_id` in one payout.
    pub fn create_payout(&self, user_id: i64, note: &str) -> Result<Payout> {
        let user = self
            .get_user(user_id)?
            .ok_or_else(|| ShopError::not_found("User", user_id))?;
        let settings = self.affiliate_settings()?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let (count, amount): (i64, i64) = tx
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM commissions
                 WHERE user_id = ?1 AND status = 'approved'",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to total approved commissions")?;
        if count == 0 {
            return Err(ShopError::Validation(format!(
                "{} has no approved commissions to pay out",
                user.email
            ))
            .into());
        }
        if amount < settings.min_payout {
            return Err(ShopError::Validation(format!(
                "Payout of {} is below the minimum of {}",
                amount, settings.min_payout
            ))
            .into());
        }

        tx.execute(
            "INSERT INTO payouts (user_id, amount, commission_count, note) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, amount, count, note.trim()],
        )
        .context("Failed to insert payout")?;
        let payout_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE commissions SET status = 'paid', payout_id = ?1, updated_at = datetime('now')
             WHERE user_id = ?2 AND status = 'approved'",
            params![payout_id, user_id],
        )
        .context("Failed to mark commissions paid")?;
        tx.execute(
            "UPDATE users SET affiliate_balance = affiliate_balance - ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![amount, user_id],
        )
        .context("Failed to debit affiliate balance")?;
        tx.commit().context("Failed to commit payout")?;

        tracing::info!(payout_id, user_id, amount, count, "Created affiliate payout");
        self.get_payout(payout_id)?
            .context("Payout not found after insert")
    }

    pub fn get_payout(&self, id: i64) -> Result<Option<Payout>> {
        self.conn
            .query_row(
                "SELECT id, user_id, amount, commission_count, note, created_at FROM payouts WHERE id = ?1",
                params![id],
                payout_from_row,
            )
            .optional()
            .context("Failed to query payout")
    }

    pub fn list_payouts(&self, user_id: Option<i64>, pagination: Pagination) -> Result<Page<Payout>> {
        let mut where_ = Filter::default();
        if let Some(uid) = user_id {
            where_.push("user_id = ?", uid);
        }
        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM payouts{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count payouts")?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, user_id, amount, commission_count, note, created_at FROM payouts{}
                 ORDER BY id DESC LIMIT ? OFFSET ?",
                where_.where_sql()
            ))
            .context("Failed to prepare list_payouts")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                payout_from_row,
            )
            .context("Failed to query payouts")?;
        let payouts = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read payout row")?;
        Ok(Page::new(payouts, total, pagination))
    }

    // ── Stats ─────────────────────────────────────────────────────────

    pub fn affiliate_stats(&self, user_id: i64) -> Result<AffiliateStats> {
        let user = self
            .get_user(user_id)?
            .ok_or_else(|| ShopError::not_found("User", user_id))?;
        let settings = self.affiliate_settings()?;

        let (links, clicks, conversions): (i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(clicks), 0), COALESCE(SUM(conversions), 0)
                 FROM affiliate_links WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to aggregate affiliate links")?;

        let commission_sum = |status: CommissionStatus| -> Result<i64> {
            self.conn
                .query_row(
                    "SELECT COALESCE(SUM(amount), 0) FROM commissions WHERE user_id = ?1 AND status = ?2",
                    params![user_id, status.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to sum commissions")
        };

        Ok(AffiliateStats {
            links,
            clicks,
            conversions,
            pending_total: commission_sum(CommissionStatus::Pending)?,
            approved_total: commission_sum(CommissionStatus::Approved)?,
            paid_total: commission_sum(CommissionStatus::Paid)?,
            balance: user.affiliate_balance,
            current_rate_bps: select_rate(
                &settings.tiers,
                user.lifetime_sales,
                settings.base_rate_bps,
            ),
        })
    }
}

/// A present `rate_bps` key, even `null`, needs `may_set_rate`.
fn check_link_rate(rate_bps: Option<Option<u32>>, may_set_rate: bool) -> Result<(), ShopError> {
    match rate_bps {
        Some(_) if !may_set_rate => Err(ShopError::Forbidden(
            "Only the back-office can change a per-link commission rate".into(),
        )),
        Some(Some(rate)) => Ok(validate_rate(rate)?),
        _ => Ok(()),
    }
}

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::ShopDb;
use crate::errors::ShopError;
use crate::shop::models::{AffiliateSettings, Setting};

pub(crate) const AFFILIATE_KEY: &str = "affiliate";

/// Prefix of the per-user permission entries; see `permissions_key`.
pub(crate) const PERMISSIONS_PREFIX: &str = "permissions:";

/// Setting keys rendered on the storefront home page.
pub const HOMEPAGE_KEYS: [&str; 5] = ["hero", "about", "testimonials", "benefits", "contact"];

impl ShopDb {
    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, value, updated_at FROM settings WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query setting")?;
        match row {
            Some((key, value, updated_at)) => {
                let value = serde_json::from_str(&value)
                    .with_context(|| format!("Setting '{}' holds invalid JSON", key))?;
                Ok(Some(Setting {
                    key,
                    value,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<Setting> {
        if key.trim().is_empty() {
            return Err(ShopError::Validation("Setting key must not be empty".into()).into());
        }
        let json = serde_json::to_string(value).context("Failed to serialize setting")?;
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, json],
            )
            .context("Failed to upsert setting")?;
        self.get_setting(key)?
            .context("Setting not found after upsert")
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(count > 0)
    }

    /// All settings except per-user permission lists.
    pub fn list_settings(&self) -> Result<Vec<Setting>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM settings WHERE substr(key, 1, ?1) != ?2 ORDER BY key")
            .context("Failed to prepare list_settings")?;
        let keys = stmt
            .query_map(
                params![PERMISSIONS_PREFIX.len() as i64, PERMISSIONS_PREFIX],
                |row| row.get::<_, String>(0),
            )
            .context("Failed to query settings")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read setting key")?;
        let mut settings = Vec::new();
        for key in keys {
            if let Some(setting) = self.get_setting(&key)? {
                settings.push(setting);
            }
        }
        Ok(settings)
    }

    /// Home page content blocks that are present, keyed by block name.
    pub fn homepage_blocks(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut blocks = serde_json::Map::new();
        for key in HOMEPAGE_KEYS {
            if let Some(setting) = self.get_setting(key)? {
                blocks.insert(key.to_string(), setting.value);
            }
        }
        Ok(blocks)
    }

    pub fn affiliate_settings(&self) -> Result<AffiliateSettings> {
        match self.get_setting(AFFILIATE_KEY)? {
            Some(setting) => serde_json::from_value(setting.value)
                .context("Stored affiliate settings are malformed"),
            None => Ok(AffiliateSettings::default()),
        }
    }

    pub fn update_affiliate_settings(&self, settings: &AffiliateSettings) -> Result<AffiliateSettings> {
        validate_affiliate_settings(settings)?;
        let value = serde_json::to_value(settings).context("Failed to serialize affiliate settings")?;
        self.put_setting(AFFILIATE_KEY, &value)?;
        self.affiliate_settings()
    }
}

/// Keys managed through their own endpoints rather than the generic
/// settings API.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(PERMISSIONS_PREFIX)
}

pub(crate) fn validate_affiliate_settings(settings: &AffiliateSettings) -> Result<(), ShopError> {
    apothecary_common::commission::validate_rate(settings.base_rate_bps)?;
    for tier in &settings.tiers {
        tier.validate()?;
        if tier.min_sales < 0 {
            return Err(ShopError::Validation("Tier min_sales must not be negative".into()));
        }
    }
    if settings.cookie_days == 0 {
        return Err(ShopError::Validation("cookie_days must be at least 1".into()));
    }
    if settings.min_payout < 0 {
        return Err(ShopError::Validation("min_payout must not be negative".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apothecary_common::CommissionTier;
    use serde_json::json;

    #[test]
    fn test_put_get_and_overwrite_setting() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        db.put_setting("hero", &json!({"title": "Thuốc nam"}))?;
        db.put_setting("hero", &json!({"title": "Đông y"}))?;
        let setting = db.get_setting("hero")?.expect("hero");
        assert_eq!(setting.value["title"], "Đông y");
        Ok(())
    }

    #[test]
    fn test_homepage_blocks_only_includes_present_keys() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        db.put_setting("about", &json!("Since 1962"))?;
        db.put_setting("unrelated", &json!(1))?;
        let blocks = db.homepage_blocks()?;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks["about"], "Since 1962");
        Ok(())
    }

    #[test]
    fn test_list_settings_hides_permission_rows() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        db.put_setting("permissions:user:9", &json!(["orders"]))?;
        db.put_setting("contact", &json!({"phone": "1900"}))?;
        let keys: Vec<String> = db.list_settings()?.into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["affiliate".to_string(), "contact".to_string()]);
        Ok(())
    }

    #[test]
    fn test_affiliate_settings_seeded_and_updatable() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        assert_eq!(db.affiliate_settings()?, AffiliateSettings::default());

        let updated = db.update_affiliate_settings(&AffiliateSettings {
            tiers: vec![CommissionTier { min_sales: 10_000_000, rate_bps: 1200 }],
            ..Default::default()
        })?;
        assert_eq!(updated.tiers.len(), 1);
        Ok(())
    }

    #[test]
    fn test_affiliate_settings_reject_bad_rate() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let err = db
            .update_affiliate_settings(&AffiliateSettings {
                base_rate_bps: 12_000,
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.downcast_ref::<ShopError>().is_some());
        Ok(())
    }
}

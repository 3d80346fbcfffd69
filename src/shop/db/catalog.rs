use std::str::FromStr;

use anyhow::{Context, Result};
use apothecary_common::{Page, Pagination, slugify};
use rusqlite::{OptionalExtension, Row, params};

use super::{Filter, ShopDb, is_foreign_key_violation, is_unique_violation, like_pattern};
use crate::errors::ShopError;
use crate::shop::models::*;

const CATEGORY_COLUMNS: &str =
    "id, name, slug, description, image, parent_id, position, created_at, updated_at";

const PRODUCT_COLUMNS: &str = "p.id, p.name, p.slug, p.sku, p.short_description, p.description, \
     p.price, p.sale_price, p.stock, p.images, p.category_id, p.status, p.featured, \
     p.created_at, p.updated_at";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        image: row.get(4)?,
        parent_id: row.get(5)?,
        position: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

struct ProductRow {
    id: i64,
    name: String,
    slug: String,
    sku: Option<String>,
    short_description: String,
    description: String,
    price: i64,
    sale_price: Option<i64>,
    stock: i64,
    images: String,
    category_id: Option<i64>,
    status: String,
    featured: bool,
    created_at: String,
    updated_at: String,
}

impl ProductRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            sku: row.get(3)?,
            short_description: row.get(4)?,
            description: row.get(5)?,
            price: row.get(6)?,
            sale_price: row.get(7)?,
            stock: row.get(8)?,
            images: row.get(9)?,
            category_id: row.get(10)?,
            status: row.get(11)?,
            featured: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_product(self) -> Result<Product> {
        let status = ProductStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse product status")?;
        let images: Vec<String> =
            serde_json::from_str(&self.images).context("Failed to parse product images JSON")?;
        Ok(Product {
            id: self.id,
            name: self.name,
            slug: self.slug,
            sku: self.sku,
            short_description: self.short_description,
            description: self.description,
            price: self.price,
            sale_price: self.sale_price,
            stock: self.stock,
            images,
            category_id: self.category_id,
            status,
            featured: self.featured,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Slug from an explicit value, or derived from the name.
fn resolve_slug(slug: Option<&str>, name: &str) -> Result<String, ShopError> {
    match slug.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(slugify(s)?),
        None => Ok(slugify(name)?),
    }
}

fn validate_prices(price: i64, sale_price: Option<i64>) -> Result<(), ShopError> {
    if price < 0 {
        return Err(ShopError::Validation("price must not be negative".into()));
    }
    match sale_price {
        Some(sale) if sale < 0 || sale >= price => Err(ShopError::Validation(
            "sale_price must be non-negative and below price".into(),
        )),
        _ => Ok(()),
    }
}

fn map_slug_conflict(e: rusqlite::Error, slug: &str, what: &str) -> anyhow::Error {
    if is_unique_violation(&e) {
        ShopError::Conflict(format!("Slug '{}' is already used by another {}", slug, what)).into()
    } else {
        anyhow::Error::new(e).context(format!("Failed to write {}", what))
    }
}

impl ShopDb {
    // ── Category CRUD ─────────────────────────────────────────────────

    pub fn create_category(&self, input: CategoryInput) -> Result<Category> {
        let name = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ShopError::Validation("name is required".into()))?
            .to_string();
        let slug = resolve_slug(input.slug.as_deref(), &name)?;
        if let Some(parent) = input.parent_id {
            self.get_category(parent)?
                .ok_or_else(|| ShopError::not_found("Category", parent))?;
        }

        self.conn
            .execute(
                "INSERT INTO categories (name, slug, description, image, parent_id, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    slug,
                    input.description.unwrap_or_default(),
                    input.image,
                    input.parent_id,
                    input.position.unwrap_or(0)
                ],
            )
            .map_err(|e| map_slug_conflict(e, &slug, "category"))?;
        let id = self.conn.last_insert_rowid();
        self.get_category(id)?
            .context("Category not found after insert")
    }

    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY position, name"
            ))
            .context("Failed to prepare list_categories")?;
        let rows = stmt
            .query_map([], category_from_row)
            .context("Failed to query categories")?;
        let mut categories = Vec::new();
        for row in rows {
            categories.push(row.context("Failed to read category row")?);
        }
        Ok(categories)
    }

    pub fn get_category(&self, id: i64) -> Result<Option<Category>> {
        self.conn
            .query_row(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                params![id],
                category_from_row,
            )
            .optional()
            .context("Failed to query category")
    }

    pub fn get_category_by_slug(&self, slug: &str) -> Result<Option<Category>> {
        self.conn
            .query_row(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE slug = ?1"),
                params![slug],
                category_from_row,
            )
            .optional()
            .context("Failed to query category by slug")
    }

    pub fn update_category(&self, id: i64, input: CategoryInput) -> Result<Category> {
        let current = self
            .get_category(id)?
            .ok_or_else(|| ShopError::not_found("Category", id))?;

        let name = match input.name.as_deref().map(str::trim) {
            Some("") => return Err(ShopError::Validation("name must not be empty".into()).into()),
            Some(n) => n.to_string(),
            None => current.name,
        };
        let slug = match input.slug.as_deref() {
            Some(s) => resolve_slug(Some(s), &name)?,
            None => current.slug,
        };
        let parent_id = input.parent_id.or(current.parent_id);
        if parent_id == Some(id) {
            return Err(ShopError::Validation("A category cannot be its own parent".into()).into());
        }

        self.conn
            .execute(
                "UPDATE categories SET name = ?1, slug = ?2, description = ?3, image = ?4,
                     parent_id = ?5, position = ?6, updated_at = datetime('now')
                 WHERE id = ?7",
                params![
                    name,
                    slug,
                    input.description.unwrap_or(current.description),
                    input.image.or(current.image),
                    parent_id,
                    input.position.unwrap_or(current.position),
                    id
                ],
            )
            .map_err(|e| map_slug_conflict(e, &slug, "category"))?;
        self.get_category(id)?
            .context("Category not found after update")
    }

    pub fn delete_category(&self, id: i64) -> Result<bool> {
        let products: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM products WHERE category_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count category products")?;
        if products > 0 {
            return Err(ShopError::Conflict(format!(
                "Category {} still has {} product(s)",
                id, products
            ))
            .into());
        }
        match self.conn.execute("DELETE FROM categories WHERE id = ?1", params![id]) {
            Ok(count) => Ok(count > 0),
            Err(e) if is_foreign_key_violation(&e) => {
                Err(ShopError::Conflict(format!("Category {} is still referenced", id)).into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to delete category")),
        }
    }

    // ── Product CRUD ──────────────────────────────────────────────────

    pub fn create_product(&self, input: ProductInput) -> Result<Product> {
        let name = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ShopError::Validation("name is required".into()))?
            .to_string();
        let price = input
            .price
            .ok_or_else(|| ShopError::Validation("price is required".into()))?;
        let sale_price = input.sale_price.flatten();
        validate_prices(price, sale_price)?;
        let stock = input.stock.unwrap_or(0);
        if stock < 0 {
            return Err(ShopError::Validation("stock must not be negative".into()).into());
        }
        let category_id = input.category_id.flatten();
        if let Some(cid) = category_id {
            self.get_category(cid)?
                .ok_or_else(|| ShopError::not_found("Category", cid))?;
        }
        let slug = resolve_slug(input.slug.as_deref(), &name)?;
        let images = serde_json::to_string(&input.images.unwrap_or_default())
            .context("Failed to serialize product images")?;

        self.conn
            .execute(
                "INSERT INTO products (name, slug, sku, short_description, description, price,
                     sale_price, stock, images, category_id, status, featured)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    name,
                    slug,
                    input.sku,
                    input.short_description.unwrap_or_default(),
                    input.description.unwrap_or_default(),
                    price,
                    sale_price,
                    stock,
                    images,
                    category_id,
                    input.status.unwrap_or_default().as_str(),
                    input.featured.unwrap_or(false)
                ],
            )
            .map_err(|e| map_slug_conflict(e, &slug, "product"))?;
        let id = self.conn.last_insert_rowid();
        self.get_product(id)?.context("Product not found after insert")
    }

    pub fn get_product(&self, id: i64) -> Result<Option<Product>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products p WHERE p.id = ?1"),
                params![id],
                ProductRow::from_row,
            )
            .optional()
            .context("Failed to query product")?;
        row.map(ProductRow::into_product).transpose()
    }

    /// Active product by slug, with its category and up to four related
    /// active products from the same category.
    pub fn get_product_detail(&self, slug: &str) -> Result<Option<ProductDetail>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {PRODUCT_COLUMNS} FROM products p WHERE p.slug = ?1 AND p.status = 'active'"
                ),
                params![slug],
                ProductRow::from_row,
            )
            .optional()
            .context("Failed to query product by slug")?;
        let product = match row {
            Some(r) => r.into_product()?,
            None => return Ok(None),
        };

        let (category, related) = match product.category_id {
            Some(cid) => {
                let category = self.get_category(cid)?;
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {PRODUCT_COLUMNS} FROM products p
                         WHERE p.category_id = ?1 AND p.id != ?2 AND p.status = 'active'
                         ORDER BY p.featured DESC, p.id DESC LIMIT 4"
                    ))
                    .context("Failed to prepare related products")?;
                let rows = stmt
                    .query_map(params![cid, product.id], ProductRow::from_row)
                    .context("Failed to query related products")?;
                let mut related = Vec::new();
                for row in rows {
                    related.push(row.context("Failed to read product row")?.into_product()?);
                }
                (category, related)
            }
            None => (None, Vec::new()),
        };

        Ok(Some(ProductDetail {
            product,
            category,
            related,
        }))
    }

    pub fn list_products(&self, filter: &ProductFilter, pagination: Pagination) -> Result<Page<Product>> {
        let mut where_ = Filter::default();
        if !filter.include_drafts {
            where_.raw("p.status = 'active'");
        }
        if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
            where_.push_repeated(
                "(p.name LIKE ? ESCAPE '\\' OR p.sku LIKE ? ESCAPE '\\')",
                like_pattern(q),
            );
        }
        if let Some(slug) = filter.category.as_deref().filter(|s| !s.is_empty()) {
            match self.get_category_by_slug(slug)? {
                Some(cat) => where_.push_repeated(
                    "(p.category_id = ? OR p.category_id IN (SELECT id FROM categories WHERE parent_id = ?))",
                    cat.id,
                ),
                None => return Ok(Page::new(Vec::new(), 0, pagination)),
            }
        }
        if let Some(min) = filter.min_price {
            where_.push("COALESCE(p.sale_price, p.price) >= ?", min);
        }
        if let Some(max) = filter.max_price {
            where_.push("COALESCE(p.sale_price, p.price) <= ?", max);
        }
        if let Some(featured) = filter.featured {
            where_.push("p.featured = ?", featured);
        }

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM products p{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count products")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products p{} ORDER BY {} LIMIT ? OFFSET ?",
                where_.where_sql(),
                filter.sort.order_by()
            ))
            .context("Failed to prepare list_products")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                ProductRow::from_row,
            )
            .context("Failed to query products")?;
        let mut products = Vec::new();
        for row in rows {
            products.push(row.context("Failed to read product row")?.into_product()?);
        }
        Ok(Page::new(products, total, pagination))
    }

    pub fn update_product(&self, id: i64, input: ProductInput) -> Result<Product> {
        let current = self
            .get_product(id)?
            .ok_or_else(|| ShopError::not_found("Product", id))?;

        let name = match input.name.as_deref().map(str::trim) {
            Some("") => return Err(ShopError::Validation("name must not be empty".into()).into()),
            Some(n) => n.to_string(),
            None => current.name,
        };
        let slug = match input.slug.as_deref() {
            Some(s) => resolve_slug(Some(s), &name)?,
            None => current.slug,
        };
        let price = input.price.unwrap_or(current.price);
        let sale_price = input.sale_price.unwrap_or(current.sale_price);
        validate_prices(price, sale_price)?;
        let stock = input.stock.unwrap_or(current.stock);
        if stock < 0 {
            return Err(ShopError::Validation("stock must not be negative".into()).into());
        }
        let category_id = input.category_id.unwrap_or(current.category_id);
        if let Some(cid) = category_id {
            self.get_category(cid)?
                .ok_or_else(|| ShopError::not_found("Category", cid))?;
        }
        let images = serde_json::to_string(&input.images.unwrap_or(current.images))
            .context("Failed to serialize product images")?;

        self.conn
            .execute(
                "UPDATE products SET name = ?1, slug = ?2, sku = ?3, short_description = ?4,
                     description = ?5, price = ?6, sale_price = ?7, stock = ?8, images = ?9,
                     category_id = ?10, status = ?11, featured = ?12, updated_at = datetime('now')
                 WHERE id = ?13",
                params![
                    name,
                    slug,
                    input.sku.or(current.sku),
                    input.short_description.unwrap_or(current.short_description),
                    input.description.unwrap_or(current.description),
                    price,
                    sale_price,
                    stock,
                    images,
                    category_id,
                    input.status.unwrap_or(current.status).as_str(),
                    input.featured.unwrap_or(current.featured),
                    id
                ],
            )
            .map_err(|e| map_slug_conflict(e, &slug, "product"))?;
        self.get_product(id)?.context("Product not found after update")
    }

    pub fn delete_product(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM products WHERE id = ?1", params![id])
            .context("Failed to delete product")?;
        Ok(count > 0)
    }

    pub fn count_products(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
            .context("Failed to count products")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shop::db::test_support;

    fn category(db: &ShopDb, name: &str, parent_id: Option<i64>) -> Result<Category> {
        db.create_category(CategoryInput {
            name: Some(name.to_string()),
            parent_id,
            ..Default::default()
        })
    }

    #[test]
    fn test_create_category_derives_slug() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let cat = category(&db, "Thảo dược", None)?;
        assert_eq!(cat.slug, "thao-duoc");
        assert_eq!(db.get_category_by_slug("thao-duoc")?.unwrap().id, cat.id);
        Ok(())
    }

    #[test]
    fn test_duplicate_category_slug_is_conflict() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        category(&db, "Trà", None)?;
        let err = category(&db, "Tra", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Conflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete_category_with_products_is_conflict() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let cat = category(&db, "Cao", None)?;
        db.create_product(ProductInput {
            name: Some("Cao ích mẫu".into()),
            price: Some(150_000),
            category_id: Some(Some(cat.id)),
            ..Default::default()
        })?;
        let err = db.delete_category(cat.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Conflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_product_validates_sale_price() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let err = db
            .create_product(ProductInput {
                name: Some("Trà".into()),
                price: Some(100),
                sale_price: Some(Some(100)),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_list_products_hides_drafts_and_filters() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let parent = category(&db, "Thuốc", None)?;
        let child = category(&db, "Thuốc bổ", Some(parent.id))?;
        let other = category(&db, "Mỹ phẩm", None)?;

        for (name, price, cat, status) in [
            ("Bổ phế", 90_000, child.id, ProductStatus::Active),
            ("An cung", 500_000, parent.id, ProductStatus::Active),
            ("Sữa rửa mặt", 120_000, other.id, ProductStatus::Active),
            ("Nháp", 10_000, parent.id, ProductStatus::Draft),
        ] {
            db.create_product(ProductInput {
                name: Some(name.into()),
                price: Some(price),
                category_id: Some(Some(cat)),
                status: Some(status),
                ..Default::default()
            })?;
        }

        let all = db.list_products(&ProductFilter::default(), Pagination::default())?;
        assert_eq!(all.total, 3);

        let by_parent = db.list_products(
            &ProductFilter {
                category: Some("thuoc".into()),
                sort: ProductSort::PriceAsc,
                ..Default::default()
            },
            Pagination::default(),
        )?;
        let names: Vec<&str> = by_parent.items.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Bổ phế", "An cung"]);

        let priced = db.list_products(
            &ProductFilter {
                min_price: Some(100_000),
                max_price: Some(200_000),
                ..Default::default()
            },
            Pagination::default(),
        )?;
        assert_eq!(priced.total, 1);
        assert_eq!(priced.items[0].name, "Sữa rửa mặt");

        let admin_view = db.list_products(
            &ProductFilter {
                include_drafts: true,
                ..Default::default()
            },
            Pagination::default(),
        )?;
        assert_eq!(admin_view.total, 4);

        let unknown = db.list_products(
            &ProductFilter {
                category: Some("nope".into()),
                ..Default::default()
            },
            Pagination::default(),
        )?;
        assert_eq!(unknown.total, 0);
        Ok(())
    }

    #[test]
    fn test_search_matches_name_and_sku() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        db.create_product(ProductInput {
            name: Some("Hoạt huyết".into()),
            sku: Some("HH-01".into()),
            price: Some(1),
            status: Some(ProductStatus::Active),
            ..Default::default()
        })?;
        test_support::active_product(&db, "Other", 1, 1)?;

        let by_sku = db.list_products(
            &ProductFilter { q: Some("hh-0".into()), ..Default::default() },
            Pagination::default(),
        )?;
        assert_eq!(by_sku.total, 1);
        Ok(())
    }

    #[test]
    fn test_product_detail_includes_related() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let cat = category(&db, "Trà", None)?;
        let mut ids = Vec::new();
        for i in 0..6 {
            let p = db.create_product(ProductInput {
                name: Some(format!("Trà {}", i)),
                price: Some(1000),
                category_id: Some(Some(cat.id)),
                status: Some(ProductStatus::Active),
                ..Default::default()
            })?;
            ids.push(p.id);
        }
        let detail = db.get_product_detail("tra-0")?.expect("detail");
        assert_eq!(detail.category.unwrap().id, cat.id);
        assert_eq!(detail.related.len(), 4);
        assert!(detail.related.iter().all(|p| p.id != ids[0]));
        Ok(())
    }

    #[test]
    fn test_update_product_clears_sale_price() -> Result<()> {
        let db = ShopDb::new_in_memory()?;
        let p = db.create_product(ProductInput {
            name: Some("Cao".into()),
            price: Some(100),
            sale_price: Some(Some(80)),
            ..Default::default()
        })?;
        let untouched = db.update_product(p.id, ProductInput { stock: Some(5), ..Default::default() })?;
        assert_eq!(untouched.sale_price, Some(80));
        assert_eq!(untouched.stock, 5);

        let cleared = db.update_product(p.id, ProductInput { sale_price: Some(None), ..Default::default() })?;
        assert_eq!(cleared.sale_price, None);
        Ok(())
    }
}

use std::str::FromStr;

use apothecary_common::{
    CommissionStatus, CommissionTier, OrderStatus, PaymentMethod, PaymentStatus,
};
use serde::{Deserialize, Serialize};

// ── Users ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Staff,
    Collaborator,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Collaborator => "collaborator",
            Self::Customer => "customer",
        }
    }

    /// Roles allowed into the back-office at all.
    pub fn is_back_office(&self) -> bool {
        matches!(self, Self::Admin | Self::Staff)
    }

    /// Roles allowed to own affiliate links.
    pub fn can_refer(&self) -> bool {
        matches!(self, Self::Admin | Self::Collaborator)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "staff" => Ok(Self::Staff),
            "collaborator" => Ok(Self::Collaborator),
            "customer" => Ok(Self::Customer),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Back-office areas a staff member can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Products,
    Categories,
    Posts,
    Orders,
    Users,
    Affiliate,
    Settings,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Permission::Products,
        Permission::Categories,
        Permission::Posts,
        Permission::Orders,
        Permission::Users,
        Permission::Affiliate,
        Permission::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Categories => "categories",
            Self::Posts => "posts",
            Self::Orders => "orders",
            Self::Users => "users",
            Self::Affiliate => "affiliate",
            Self::Settings => "settings",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub active: bool,
    /// Approved, not yet paid-out commission in VND.
    pub affiliate_balance: i64,
    /// Order totals from approved referrals; drives the commission tier.
    pub lifetime_sales: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: Option<Role>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilter {
    pub q: Option<String>,
    pub role: Option<Role>,
}

// ── Catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub image: Option<String>,
    pub parent_id: Option<i64>,
    pub position: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryInput {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub parent_id: Option<i64>,
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Draft,
    Active,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
        }
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            _ => Err(format!("Invalid product status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub sku: Option<String>,
    pub short_description: String,
    pub description: String,
    pub price: i64,
    pub sale_price: Option<i64>,
    pub stock: i64,
    pub images: Vec<String>,
    pub category_id: Option<i64>,
    pub status: ProductStatus,
    pub featured: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Product {
    /// The price a customer pays right now.
    pub fn effective_price(&self) -> i64 {
        self.sale_price.unwrap_or(self.price)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductInput {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub sku: Option<String>,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    /// `Some(None)` clears the sale price.
    #[serde(default, with = "double_option")]
    pub sale_price: Option<Option<i64>>,
    pub stock: Option<i64>,
    pub images: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    pub category_id: Option<Option<i64>>,
    pub status: Option<ProductStatus>,
    pub featured: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
    Name,
}

impl ProductSort {
    pub fn order_by(&self) -> &'static str {
        match self {
            Self::Newest => "p.id DESC",
            Self::PriceAsc => "COALESCE(p.sale_price, p.price) ASC, p.id DESC",
            Self::PriceDesc => "COALESCE(p.sale_price, p.price) DESC, p.id DESC",
            Self::Name => "p.name COLLATE NOCASE ASC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductFilter {
    pub q: Option<String>,
    /// Category slug; products in its direct children match too.
    pub category: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub featured: Option<bool>,
    #[serde(default)]
    pub sort: ProductSort,
    /// Back-office listings include drafts.
    #[serde(skip)]
    pub include_drafts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    pub category: Option<Category>,
    pub related: Vec<Product>,
}

// ── Blog ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCategory {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostCategoryInput {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    Draft,
    Published,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            _ => Err(format!("Invalid post status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub content: String,
    pub cover_image: Option<String>,
    pub category_id: Option<i64>,
    pub author_id: Option<i64>,
    pub status: PostStatus,
    pub published_at: Option<String>,
    pub view_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostInput {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub excerpt: Option<String>,
    pub content: Option<String>,
    #[serde(default, with = "double_option")]
    pub cover_image: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub category_id: Option<Option<i64>>,
    pub status: Option<PostStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostFilter {
    pub q: Option<String>,
    pub category: Option<String>,
    #[serde(skip)]
    pub include_drafts: bool,
}

// ── Cart ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: i64,
    pub name: String,
    pub slug: String,
    pub image: Option<String>,
    pub unit_price: i64,
    pub quantity: i64,
    pub line_total: i64,
    pub stock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartView {
    pub lines: Vec<CartLine>,
    pub item_count: i64,
    pub subtotal: i64,
}

// ── Orders ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_code: String,
    pub user_id: i64,
    pub status: OrderStatus,
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    pub note: String,
    pub subtotal: i64,
    pub total: i64,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub affiliate_link_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub line_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: i64,
    pub paid_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: Option<Payment>,
    pub commission: Option<Commission>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutInput {
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub q: Option<String>,
    #[serde(skip)]
    pub user_id: Option<i64>,
}

/// Side effects of an order status change, for notification.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub order: Order,
    pub from: OrderStatus,
    pub commission: Option<Commission>,
}

// ── Affiliate ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cookie_days")]
    pub cookie_days: u32,
    #[serde(default = "default_base_rate_bps")]
    pub base_rate_bps: u32,
    #[serde(default)]
    pub tiers: Vec<CommissionTier>,
    #[serde(default = "default_min_payout")]
    pub min_payout: i64,
}

impl Default for AffiliateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cookie_days: default_cookie_days(),
            base_rate_bps: default_base_rate_bps(),
            tiers: Vec::new(),
            min_payout: default_min_payout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cookie_days() -> u32 {
    30
}

fn default_base_rate_bps() -> u32 {
    1000
}

fn default_min_payout() -> i64 {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateLink {
    pub id: i64,
    pub user_id: i64,
    pub code: String,
    pub name: String,
    pub product_id: Option<i64>,
    pub category_id: Option<i64>,
    pub rate_bps: Option<u32>,
    pub clicks: i64,
    pub conversions: i64,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AffiliateLinkInput {
    pub name: Option<String>,
    #[serde(default, with = "double_option")]
    pub product_id: Option<Option<i64>>,
    #[serde(default, with = "double_option")]
    pub category_id: Option<Option<i64>>,
    /// Only back-office users may set a per-link rate.
    #[serde(default, with = "double_option")]
    pub rate_bps: Option<Option<u32>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commission {
    pub id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub link_id: Option<i64>,
    pub order_total: i64,
    pub rate_bps: u32,
    pub amount: i64,
    pub status: CommissionStatus,
    pub payout_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommissionFilter {
    pub status: Option<CommissionStatus>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub commission_count: i64,
    pub note: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub links: i64,
    pub clicks: i64,
    pub conversions: i64,
    pub pending_total: i64,
    pub approved_total: i64,
    pub paid_total: i64,
    pub balance: i64,
    pub current_rate_bps: u32,
}

/// Where a click on an affiliate link should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickRedirect {
    pub link_id: i64,
    pub location: String,
}

// ── Back-office ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub users: i64,
    pub products: i64,
    pub orders: i64,
    pub pending_orders: i64,
    pub revenue: i64,
    pub pending_commissions: i64,
    pub approved_commissions: i64,
}

/// Distinguishes "field absent" from "field explicitly null" in PATCH bodies.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Admin, Role::Staff, Role::Collaborator, Role::Customer] {
            assert_eq!(Role::from_str(role.as_str()).unwrap(), role);
        }
        assert!(Role::from_str("root").is_err());
    }

    #[test]
    fn test_effective_price_prefers_sale() {
        let mut product = Product {
            id: 1,
            name: "Trà gừng".into(),
            slug: "tra-gung".into(),
            sku: None,
            short_description: String::new(),
            description: String::new(),
            price: 120_000,
            sale_price: None,
            stock: 3,
            images: vec![],
            category_id: None,
            status: ProductStatus::Active,
            featured: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(product.effective_price(), 120_000);
        product.sale_price = Some(99_000);
        assert_eq!(product.effective_price(), 99_000);
    }

    #[test]
    fn test_patch_distinguishes_null_from_missing() {
        let absent: ProductInput = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert_eq!(absent.sale_price, None);

        let cleared: ProductInput = serde_json::from_str(r#"{"sale_price": null}"#).unwrap();
        assert_eq!(cleared.sale_price, Some(None));

        let set: ProductInput = serde_json::from_str(r#"{"sale_price": 5000}"#).unwrap();
        assert_eq!(set.sale_price, Some(Some(5000)));
    }

    #[test]
    fn test_affiliate_settings_defaults_fill_missing_fields() {
        let settings: AffiliateSettings = serde_json::from_str(r#"{"cookie_days": 7}"#).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.cookie_days, 7);
        assert_eq!(settings.base_rate_bps, 1000);
        assert_eq!(settings.min_payout, 100_000);
    }
}

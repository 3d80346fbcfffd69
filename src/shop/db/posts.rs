use std::str::FromStr;

use anyhow::{Context, Result};
use apothecary_common::{Page, Pagination, slugify};
use rusqlite::{OptionalExtension, Row, params};

use super::{Filter, ShopDb, is_unique_violation, like_pattern};
use crate::errors::ShopError;
use crate::shop::models::*;

const POST_COLUMNS: &str = "p.id, p.title, p.slug, p.excerpt, p.content, p.cover_image, \
     p.category_id, p.author_id, p.status, p.published_at, p.view_count, p.created_at, p.updated_at";

struct PostRow {
    id: i64,
    title: String,
    slug: String,
    excerpt: String,
    content: String,
    cover_image: Option<String>,
    category_id: Option<i64>,
    author_id: Option<i64>,
    status: String,
    published_at: Option<String>,
    view_count: i64,
    created_at: String,
    updated_at: String,
}

impl PostRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            slug: row.get(2)?,
            excerpt: row.get(3)?,
            content: row.get(4)?,
            cover_image: row.get(5)?,
            category_id: row.get(6)?,
            author_id: row.get(7)?,
            status: row.get(8)?,
            published_at: row.get(9)?,
            view_count: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_post(self) -> Result<Post> {
        let status = PostStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse post status")?;
        Ok(Post {
            id: self.id,
            title: self.title,
            slug: self.slug,
            excerpt: self.excerpt,
            content: self.content,
            cover_image: self.cover_image,
            category_id: self.category_id,
            author_id: self.author_id,
            status,
            published_at: self.published_at,
            view_count: self.view_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn post_category_from_row(row: &Row<'_>) -> rusqlite::Result<PostCategory> {
    Ok(PostCategory {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn slug_conflict(e: rusqlite::Error, slug: &str) -> anyhow::Error {
    if is_unique_violation(&e) {
        ShopError::Conflict(format!("Slug '{}' is already in use", slug)).into()
    } else {
        anyhow::Error::new(e).context("Failed to write blog row")
    }
}

fn required(value: Option<&str>, field: &str) -> Result<String, ShopError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ShopError::Validation(format!("{} is required", field)))
}

impl ShopDb {
    // ── Post categories ───────────────────────────────────────────────

    pub fn create_post_category(&self, input: PostCategoryInput) -> Result<PostCategory> {
        let name = required(input.name.as_deref(), "name")?;
        let slug = slugify(input.slug.as_deref().unwrap_or(&name))?;
        self.conn
            .execute(
                "INSERT INTO post_categories (name, slug, description) VALUES (?1, ?2, ?3)",
                params![name, slug, input.description.unwrap_or_default()],
            )
            .map_err(|e| slug_conflict(e, &slug))?;
        let id = self.conn.last_insert_rowid();
        self.get_post_category(id)?
            .context("Post category not found after insert")
    }

    pub fn list_post_categories(&self) -> Result<Vec<PostCategory>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, slug, description, created_at FROM post_categories ORDER BY name",
            )
            .context("Failed to prepare list_post_categories")?;
        let rows = stmt
            .query_map([], post_category_from_row)
            .context("Failed to query post categories")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read post category row")
    }

    pub fn get_post_category(&self, id: i64) -> Result<Option<PostCategory>> {
        self.conn
            .query_row(
                "SELECT id, name, slug, description, created_at FROM post_categories WHERE id = ?1",
                params![id],
                post_category_from_row,
            )
            .optional()
            .context("Failed to query post category")
    }

    pub fn update_post_category(&self, id: i64, input: PostCategoryInput) -> Result<PostCategory> {
        let current = self
            .get_post_category(id)?
            .ok_or_else(|| ShopError::not_found("Post category", id))?;
        let name = match input.name.as_deref() {
            Some(n) => required(Some(n), "name")?,
            None => current.name,
        };
        let slug = match input.slug.as_deref() {
            Some(s) => slugify(s)?,
            None => current.slug,
        };
        self.conn
            .execute(
                "UPDATE post_categories SET name = ?1, slug = ?2, description = ?3 WHERE id = ?4",
                params![
                    name,
                    slug,
                    input.description.unwrap_or(current.description),
                    id
                ],
            )
            .map_err(|e| slug_conflict(e, &slug))?;
        self.get_post_category(id)?
            .context("Post category not found after update")
    }

    /// Posts in the category keep existing and lose their category.
    pub fn delete_post_category(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM post_categories WHERE id = ?1", params![id])
            .context("Failed to delete post category")?;
        Ok(count > 0)
    }

    // ── Posts ─────────────────────────────────────────────────────────

    pub fn create_post(&self, author_id: i64, input: PostInput) -> Result<Post> {
        let title = required(input.title.as_deref(), "title")?;
        let slug = slugify(input.slug.as_deref().unwrap_or(&title))?;
        let category_id = input.category_id.flatten();
        if let Some(cid) = category_id {
            self.get_post_category(cid)?
                .ok_or_else(|| ShopError::not_found("Post category", cid))?;
        }
        let status = input.status.unwrap_or_default();

        self.conn
            .execute(
                "INSERT INTO posts (title, slug, excerpt, content, cover_image, category_id,
                     author_id, status, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                     CASE WHEN ?8 = 'published' THEN datetime('now') END)",
                params![
                    title,
                    slug,
                    input.excerpt.unwrap_or_default(),
                    input.content.unwrap_or_default(),
                    input.cover_image.flatten(),
                    category_id,
                    author_id,
                    status.as_str()
                ],
            )
            .map_err(|e| slug_conflict(e, &slug))?;
        let id = self.conn.last_insert_rowid();
        self.get_post(id)?.context("Post not found after insert")
    }

    pub fn get_post(&self, id: i64) -> Result<Option<Post>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {POST_COLUMNS} FROM posts p WHERE p.id = ?1"),
                params![id],
                PostRow::from_row,
            )
            .optional()
            .context("Failed to query post")?;
        row.map(PostRow::into_post).transpose()
    }

    /// Published post by slug. Each read counts as a view.
    pub fn view_published_post(&self, slug: &str) -> Result<Option<Post>> {
        let updated = self
            .conn
            .execute(
                "UPDATE posts SET view_count = view_count + 1
                 WHERE slug = ?1 AND status = 'published'",
                params![slug],
            )
            .context("Failed to increment post views")?;
        if updated == 0 {
            return Ok(None);
        }
        let row = self
            .conn
            .query_row(
                &format!("SELECT {POST_COLUMNS} FROM posts p WHERE p.slug = ?1"),
                params![slug],
                PostRow::from_row,
            )
            .optional()
            .context("Failed to query post by slug")?;
        row.map(PostRow::into_post).transpose()
    }

    pub fn list_posts(&self, filter: &PostFilter, pagination: Pagination) -> Result<Page<Post>> {
        let mut where_ = Filter::default();
        if !filter.include_drafts {
            where_.raw("p.status = 'published'");
        }
        if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
            where_.push_repeated(
                "(p.title LIKE ? ESCAPE '\\' OR p.excerpt LIKE ? ESCAPE '\\')",
                like_pattern(q),
            );
        }
        if let Some(slug) = filter.category.as_deref().filter(|s| !s.is_empty()) {
            where_.push(
                "p.category_id = (SELECT id FROM post_categories WHERE slug = ?)",
                slug.to_string(),
            );
        }

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM posts p{}", where_.where_sql()),
                where_.params(),
                |row| row.get(0),
            )
            .context("Failed to count posts")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {POST_COLUMNS} FROM posts p{}
                 ORDER BY COALESCE(p.published_at, p.created_at) DESC, p.id DESC
                 LIMIT ? OFFSET ?",
                where_.where_sql()
            ))
            .context("Failed to prepare list_posts")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    where_.paged_params(pagination.limit_i64(), pagination.offset()),
                ),
                PostRow::from_row,
            )
            .context("Failed to query posts")?;
        let mut posts = Vec::new();
        for row in rows {
            posts.push(row.context("Failed to read post row")?.into_post()?);
        }
        Ok(Page::new(posts, total, pagination))
    }

    pub fn update_post(&self, id: i64, input: PostInput) -> Result<Post> {
        let current = self
            .get_post(id)?
            .ok_or_else(|| ShopError::not_found("Post", id))?;
        let title = match input.title.as_deref() {
            Some(t) => required(Some(t), "title")?,
            None => current.title,
        };
        let slug = match input.slug.as_deref() {
            Some(s) => slugify(s)?,
            None => current.slug,
        };
        let category_id = input.category_id.unwrap_or(current.category_id);
        if let Some(cid) = category_id {
            self.get_post_category(cid)?
                .ok_or_else(|| ShopError::not_found("Post category", cid))?;
        }
        let status = input.status.unwrap_or(current.status);

        // published_at is stamped on the first publish and kept afterwards.
        self.conn
            .execute(
                "UPDATE posts SET title = ?1, slug = ?2, excerpt = ?3, content = ?4,
                     cover_image = ?5, category_id = ?6, status = ?7,
                     published_at = CASE
                         WHEN ?7 = 'published' AND published_at IS NULL THEN datetime('now')
                         ELSE published_at END,
                     updated_at = datetime('now')
                 WHERE id = ?8",
                params![
                    title,
                    slug,
                    input.excerpt.unwrap_or(current.excerpt),
                    input.content.unwrap_or(current.content),
                    input.cover_image.unwrap_or(current.cover_image),
                    category_id,
                    status.as_str(),
                    id
                ],
            )
            .map_err(|e| slug_conflict(e, &slug))?;
        self.get_post(id)?.context("Post not found after update")
    }

    pub fn delete_post(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM posts WHERE id = ?1", params![id])
            .context("Failed to delete post")?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(db: &ShopDb, title: &str, status: PostStatus) -> Result<Post> {
        db.create_post(
            1,
            PostInput {
                title: Some(title.to_string()),
                status: Some(status),
                ..Default::default()
            },
        )
    }

    fn db_with_author() -> Result<ShopDb> {
        let db = ShopDb::new_in_memory()?;
        db.create_user("author@example.com", "hash", "Author", None, Role::Staff)?;
        Ok(db)
    }

    #[test]
    fn test_publish_stamps_published_at_once() -> Result<()> {
        let db = db_with_author()?;
        let draft = post(&db, "Công dụng của gừng", PostStatus::Draft)?;
        assert_eq!(draft.slug, "cong-dung-cua-gung");
        assert!(draft.published_at.is_none());

        let published = db.update_post(
            draft.id,
            PostInput { status: Some(PostStatus::Published), ..Default::default() },
        )?;
        let stamp = published.published_at.clone().expect("published_at");

        let edited = db.update_post(
            draft.id,
            PostInput { excerpt: Some("Gừng ấm bụng".into()), ..Default::default() },
        )?;
        assert_eq!(edited.published_at, Some(stamp));
        Ok(())
    }

    #[test]
    fn test_list_posts_hides_drafts_unless_requested() -> Result<()> {
        let db = db_with_author()?;
        post(&db, "Một", PostStatus::Published)?;
        post(&db, "Hai", PostStatus::Draft)?;

        let public = db.list_posts(&PostFilter::default(), Pagination::default())?;
        assert_eq!(public.total, 1);

        let admin = db.list_posts(
            &PostFilter { include_drafts: true, ..Default::default() },
            Pagination::default(),
        )?;
        assert_eq!(admin.total, 2);
        Ok(())
    }

    #[test]
    fn test_filter_by_post_category() -> Result<()> {
        let db = db_with_author()?;
        let cat = db.create_post_category(PostCategoryInput {
            name: Some("Sức khỏe".into()),
            ..Default::default()
        })?;
        db.create_post(
            1,
            PostInput {
                title: Some("Ngủ ngon".into()),
                category_id: Some(Some(cat.id)),
                status: Some(PostStatus::Published),
                ..Default::default()
            },
        )?;
        post(&db, "Khác", PostStatus::Published)?;

        let page = db.list_posts(
            &PostFilter { category: Some("suc-khoe".into()), ..Default::default() },
            Pagination::default(),
        )?;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].title, "Ngủ ngon");
        Ok(())
    }

    #[test]
    fn test_view_counts_and_ignores_drafts() -> Result<()> {
        let db = db_with_author()?;
        post(&db, "Bài viết", PostStatus::Published)?;
        post(&db, "Nháp", PostStatus::Draft)?;

        db.view_published_post("bai-viet")?;
        let viewed = db.view_published_post("bai-viet")?.expect("post");
        assert_eq!(viewed.view_count, 2);
        assert!(db.view_published_post("nhap")?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_post_slug_is_conflict() -> Result<()> {
        let db = db_with_author()?;
        post(&db, "Trùng", PostStatus::Draft)?;
        let err = post(&db, "Trung", PostStatus::Draft).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Conflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_deleting_category_detaches_posts() -> Result<()> {
        let db = db_with_author()?;
        let cat = db.create_post_category(PostCategoryInput {
            name: Some("Tin tức".into()),
            ..Default::default()
        })?;
        let p = db.create_post(
            1,
            PostInput {
                title: Some("Tin".into()),
                category_id: Some(Some(cat.id)),
                ..Default::default()
            },
        )?;
        assert!(db.delete_post_category(cat.id)?);
        assert_eq!(db.get_post(p.id)?.unwrap().category_id, None);
        Ok(())
    }
}

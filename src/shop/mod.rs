//! The storefront application.
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Domain types shared by the database and the API         |
//! | `db`       | SQLite persistence, one `impl ShopDb` block per feature |
//! | `auth`     | Password hashing, session tokens, request extractors    |
//! | `api`      | JSON handlers grouped by feature                        |
//! | `ws`       | Live event feed for back-office dashboards              |
//! | `media`    | Storage for uploaded images                             |
//! | `embedded` | The storefront bundle compiled into the binary          |
//! | `server`   | Router assembly and the serve loop                      |

pub mod api;
pub mod auth;
pub mod db;
pub mod embedded;
pub mod media;
pub mod models;
pub mod server;
pub mod ws;

//! Relational storage for chat sessions and messages.
//!
//! Each concern is a trait ([`SessionStore`], [`MessageStore`]) implemented by
//! [`SqliteStore`]. Trait methods use `impl Future` in their signatures, so no
//! `async-trait` is needed. The pipeline's own repository traits
//! (`MessageRepository`, `TurnRepository`) are implemented in [`message`].
//!
//! `sqlx::migrate!("./migrations")` resolves the path at compile time relative
//! to the crate root, so the migrations are embedded in the binary.

pub mod dao;
pub mod message;
pub mod session;

pub use dao::{ChatSession, Message};
pub use message::MessageStore;
pub use session::SessionStore;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://parley.db?mode=rwc"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        Self::migrate(pool).await
    }

    /// A private in-memory database, for tests.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

use chrono::{DateTime, Duration, Utc};

use super::models::Session;
use super::DbPool;

/// Login sessions keyed by the SHA-256 digest of the bearer token.
#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, token_hash: &str, ttl: Duration) -> Result<Session, sqlx::Error> {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            token_hash: token_hash.to_string(),
            expires_at: (now + ttl).to_rfc3339(),
            created_at: now.to_rfc3339(),
        };

        sqlx::query(
            "INSERT INTO sessions (id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.token_hash)
        .bind(&session.expires_at)
        .bind(&session.created_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    /// Returns the session when it exists and has not expired. Expired rows
    /// are removed on sight.
    pub async fn find_valid(&self, token_hash: &str) -> Result<Option<Session>, sqlx::Error> {
        let session: Option<Session> =
            sqlx::query_as("SELECT * FROM sessions WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;

        let Some(session) = session else {
            return Ok(None);
        };

        let expired = DateTime::parse_from_rfc3339(&session.expires_at)
            .map(|t| t.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(true);
        if expired {
            self.delete(token_hash).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub async fn delete(&self, token_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

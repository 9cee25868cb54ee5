//! App persistence: one row per managed app, JSON maps stored as TEXT.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::FromRow;

use super::models::{App, AppStatus, RestartPolicy};
use super::DbPool;

#[derive(Debug, FromRow)]
struct AppRow {
    id: String,
    name: String,
    slug: String,
    description: String,
    repo_url: String,
    branch: String,
    last_commit: Option<String>,
    last_pulled: Option<String>,
    dockerfile_path: String,
    build_context: String,
    build_args: String,
    image_name: String,
    container_name: String,
    internal_port: i64,
    external_port: i64,
    restart_policy: String,
    env: String,
    volumes: String,
    status: String,
    container_id: Option<String>,
    last_build: Option<String>,
    last_build_duration: Option<String>,
    last_build_success: bool,
    image_size: i64,
    created_at: String,
    updated_at: String,
}

fn decode_err<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(decode_err)
}

fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    value.as_deref().map(parse_time).transpose()
}

fn parse_json<T: DeserializeOwned>(value: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(value).map_err(decode_err)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

impl TryFrom<AppRow> for App {
    type Error = sqlx::Error;

    fn try_from(row: AppRow) -> Result<Self, Self::Error> {
        Ok(App {
            build_args: parse_json(&row.build_args)?,
            env: parse_json(&row.env)?,
            volumes: parse_json(&row.volumes)?,
            internal_port: u16::try_from(row.internal_port).map_err(decode_err)?,
            external_port: u16::try_from(row.external_port).map_err(decode_err)?,
            last_pulled: parse_opt_time(row.last_pulled)?,
            last_build: parse_opt_time(row.last_build)?,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
            restart_policy: RestartPolicy::from(row.restart_policy),
            status: AppStatus::from(row.status),
            id: row.id,
            name: row.name,
            slug: row.slug,
            description: row.description,
            repo_url: row.repo_url,
            branch: row.branch,
            last_commit: row.last_commit,
            dockerfile_path: row.dockerfile_path,
            build_context: row.build_context,
            image_name: row.image_name,
            container_name: row.container_name,
            container_id: row.container_id,
            last_build_duration: row.last_build_duration,
            last_build_success: row.last_build_success,
            image_size: row.image_size,
        })
    }
}

/// CRUD over the `apps` table.
#[derive(Clone)]
pub struct AppStore {
    pool: DbPool,
}

impl AppStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, app: &App) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO apps (
                id, name, slug, description, repo_url, branch, last_commit, last_pulled,
                dockerfile_path, build_context, build_args, image_name, container_name,
                internal_port, external_port, restart_policy, env, volumes, status,
                container_id, last_build, last_build_duration, last_build_success,
                image_size, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&app.id)
        .bind(&app.name)
        .bind(&app.slug)
        .bind(&app.description)
        .bind(&app.repo_url)
        .bind(&app.branch)
        .bind(&app.last_commit)
        .bind(app.last_pulled.map(|t| t.to_rfc3339()))
        .bind(&app.dockerfile_path)
        .bind(&app.build_context)
        .bind(to_json(&app.build_args)?)
        .bind(&app.image_name)
        .bind(&app.container_name)
        .bind(app.internal_port as i64)
        .bind(app.external_port as i64)
        .bind(app.restart_policy.as_str())
        .bind(to_json(&app.env)?)
        .bind(to_json(&app.volumes)?)
        .bind(app.status.as_str())
        .bind(&app.container_id)
        .bind(app.last_build.map(|t| t.to_rfc3339()))
        .bind(&app.last_build_duration)
        .bind(app.last_build_success)
        .bind(app.image_size)
        .bind(app.created_at.to_rfc3339())
        .bind(app.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<App>, sqlx::Error> {
        let row: Option<AppRow> = sqlx::query_as("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(App::try_from).transpose()
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<App>, sqlx::Error> {
        let row: Option<AppRow> = sqlx::query_as("SELECT * FROM apps WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(App::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<App>, sqlx::Error> {
        let rows: Vec<AppRow> = sqlx::query_as("SELECT * FROM apps ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(App::try_from).collect()
    }

    /// Writes every mutable column of `app`. Identity and `created_at` are
    /// never rewritten.
    pub async fn update(&self, app: &App) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE apps SET
                name = ?, description = ?, branch = ?, last_commit = ?, last_pulled = ?,
                dockerfile_path = ?, build_context = ?, build_args = ?, image_name = ?,
                container_name = ?, internal_port = ?, external_port = ?, restart_policy = ?,
                env = ?, volumes = ?, status = ?, container_id = ?, last_build = ?,
                last_build_duration = ?, last_build_success = ?, image_size = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.branch)
        .bind(&app.last_commit)
        .bind(app.last_pulled.map(|t| t.to_rfc3339()))
        .bind(&app.dockerfile_path)
        .bind(&app.build_context)
        .bind(to_json(&app.build_args)?)
        .bind(&app.image_name)
        .bind(&app.container_name)
        .bind(app.internal_port as i64)
        .bind(app.external_port as i64)
        .bind(app.restart_policy.as_str())
        .bind(to_json(&app.env)?)
        .bind(to_json(&app.volumes)?)
        .bind(app.status.as_str())
        .bind(&app.container_id)
        .bind(app.last_build.map(|t| t.to_rfc3339()))
        .bind(&app.last_build_duration)
        .bind(app.last_build_success)
        .bind(app.image_size)
        .bind(app.updated_at.to_rfc3339())
        .bind(&app.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    /// Returns `false` when no row matched.
    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// External ports recorded by persisted apps, optionally ignoring one app's
    /// own record.
    pub async fn used_ports(&self, exclude_app: Option<&str>) -> Result<Vec<u16>, sqlx::Error> {
        let rows: Vec<(i64,)> = match exclude_app {
            Some(id) => {
                sqlx::query_as("SELECT external_port FROM apps WHERE id != ? ORDER BY external_port")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT external_port FROM apps ORDER BY external_port")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows
            .into_iter()
            .filter_map(|(port,)| u16::try_from(port).ok())
            .collect())
    }
}

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{ProfileRepo, RepoError},
    domain::entities::AuthorProfile,
    domain::types::UserId,
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id: Uuid,
    display_name: String,
    avatar_url: Option<String>,
    updated_at: OffsetDateTime,
}

impl From<ProfileRow> for AuthorProfile {
    fn from(row: ProfileRow) -> Self {
        Self {
            user_id: row.user_id.into(),
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl ProfileRepo for PostgresRepositories {
    async fn upsert_profile(&self, profile: &AuthorProfile) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        Self::ensure_user(&mut tx, profile.user_id)
            .await
            .map_err(map_sqlx_error)?;

        // Older replicas never overwrite newer ones on redelivery.
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, display_name, avatar_url, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                avatar_url = EXCLUDED.avatar_url,
                updated_at = EXCLUDED.updated_at
            WHERE profiles.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.display_name)
        .bind(profile.avatar_url.as_deref())
        .bind(profile.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn find_profile(&self, user: UserId) -> Result<Option<AuthorProfile>, RepoError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT user_id, display_name, avatar_url, updated_at
            FROM profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(AuthorProfile::from))
    }
}

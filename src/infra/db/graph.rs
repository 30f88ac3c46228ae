use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    application::repos::{RelationshipRepo, RepoError},
    domain::types::{RelationshipStatus, UserId},
};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl RelationshipRepo for PostgresRepositories {
    async fn friend_ids(&self, user: UserId) -> Result<Vec<UserId>, RepoError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT friend_id FROM friend_edges WHERE user_id = $1 ORDER BY friend_id",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn upsert_or_remove_edge(
        &self,
        user_a: UserId,
        user_b: UserId,
        status: RelationshipStatus,
    ) -> Result<(), RepoError> {
        if user_a == user_b {
            return Err(RepoError::invalid_input("self edges are not allowed"));
        }

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        if status.creates_edge() {
            for user in [user_a, user_b] {
                Self::ensure_user(&mut tx, user)
                    .await
                    .map_err(map_sqlx_error)?;
            }
            sqlx::query(
                r#"
                INSERT INTO friend_edges (user_id, friend_id)
                VALUES ($1, $2), ($2, $1)
                ON CONFLICT (user_id, friend_id) DO NOTHING
                "#,
            )
            .bind(user_a)
            .bind(user_b)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        } else {
            sqlx::query(
                r#"
                DELETE FROM friend_edges
                WHERE (user_id = $1 AND friend_id = $2)
                   OR (user_id = $2 AND friend_id = $1)
                "#,
            )
            .bind(user_a)
            .bind(user_b)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn sync_user_node(&self, user: UserId) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        Self::ensure_user(&mut tx, user)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)
    }
}

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{
        ContentRepo, ContentWriteRepo, FeedCandidateFilter, NewContent, PageWindow, RepoError,
    },
    domain::entities::{AuthorSummary, ContentItem},
    domain::types::{ContentId, ContentStatus, Privacy},
};

use super::{PostgresRepositories, map_sqlx_error};

const CONTENT_SELECT: &str = "SELECT c.id, c.author_id, c.privacy, c.status, c.body, \
    c.created_at, pr.display_name, pr.avatar_url \
    FROM content_items c \
    LEFT JOIN profiles pr ON pr.user_id = c.author_id ";

#[derive(sqlx::FromRow)]
struct ContentRow {
    id: Uuid,
    author_id: Uuid,
    privacy: Privacy,
    status: ContentStatus,
    body: String,
    created_at: OffsetDateTime,
    display_name: Option<String>,
    avatar_url: Option<String>,
}

impl From<ContentRow> for ContentItem {
    fn from(row: ContentRow) -> Self {
        let author = row.display_name.map(|display_name| AuthorSummary {
            display_name,
            avatar_url: row.avatar_url,
        });
        Self {
            id: row.id.into(),
            author_id: row.author_id.into(),
            privacy: row.privacy,
            status: row.status,
            body: row.body,
            created_at: row.created_at,
            author,
        }
    }
}

fn to_i64(value: usize, field: &str) -> Result<i64, RepoError> {
    i64::try_from(value).map_err(|_| RepoError::invalid_input(format!("{field} out of range")))
}

impl PostgresRepositories {
    fn push_candidate_filter<'q>(
        qb: &mut QueryBuilder<'q, Postgres>,
        filter: &'q FeedCandidateFilter,
    ) {
        let friends: Vec<Uuid> = filter.friend_ids.iter().map(|id| id.0).collect();
        let privacies: Vec<&'static str> = filter
            .friend_privacies
            .iter()
            .map(|privacy| privacy.as_str())
            .collect();

        qb.push(" WHERE c.status = 'active'::content_status AND (c.author_id = ");
        qb.push_bind(filter.viewer);
        qb.push(" OR (c.author_id = ANY(");
        qb.push_bind(friends);
        qb.push(") AND c.privacy::text = ANY(");
        qb.push_bind(privacies);
        qb.push(")))");
    }
}

#[async_trait]
impl ContentRepo for PostgresRepositories {
    async fn find_by_id(&self, id: ContentId) -> Result<Option<ContentItem>, RepoError> {
        let sql = format!("{CONTENT_SELECT} WHERE c.id = $1");
        let row = sqlx::query_as::<_, ContentRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(ContentItem::from))
    }

    async fn query_feed_candidates(
        &self,
        filter: &FeedCandidateFilter,
        window: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError> {
        let limit = to_i64(window.limit, "limit")?;
        let offset = to_i64(window.offset, "offset")?;

        let mut qb = QueryBuilder::<Postgres>::new(CONTENT_SELECT);
        Self::push_candidate_filter(&mut qb, filter);
        qb.push(" ORDER BY c.created_at DESC, c.id DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb
            .build_query_as::<ContentRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(ContentItem::from).collect())
    }
}

#[async_trait]
impl ContentWriteRepo for PostgresRepositories {
    async fn insert_content(&self, params: NewContent) -> Result<ContentItem, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        Self::ensure_user(&mut tx, params.author_id)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO content_items (id, author_id, privacy, status, body, created_at)
            VALUES ($1, $2, $3, 'active', $4, $5)
            "#,
        )
        .bind(params.id)
        .bind(params.author_id)
        .bind(params.privacy)
        .bind(&params.body)
        .bind(params.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        self.find_by_id(params.id).await?.ok_or(RepoError::NotFound)
    }

    async fn set_status(
        &self,
        id: ContentId,
        status: ContentStatus,
    ) -> Result<ContentItem, RepoError> {
        let updated = sqlx::query("UPDATE content_items SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if updated.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }

        self.find_by_id(id).await?.ok_or(RepoError::NotFound)
    }
}

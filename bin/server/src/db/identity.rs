//! PostgreSQL storage for users and SSO links.

use async_trait::async_trait;
use campus_sso_core::{SsoLinkId, UserId};
use campus_sso_identity::{
    AccountCreation, LinkRemoval, LinkStore, PasswordState, Provider, Role, Secret, SsoLink,
    StoreError, TokenSet, Upserted, User, UserDirectory, normalize_email,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres};
use std::str::FromStr;
use tracing::{debug, instrument};

/// Builds a decode error for a column holding an unexpected value.
pub(crate) fn invalid_data(message: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    )))
}

/// Maps a sqlx error onto the store taxonomy.
///
/// Unique violations become `Conflict` so callers can retry after a concurrent
/// writer wins; a foreign key violation means the referenced user is gone.
pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict {
                reason: db.constraint().map_or_else(
                    || db.message().to_string(),
                    |c| format!("unique constraint {c} violated"),
                ),
            };
        }
        if db.is_foreign_key_violation() {
            return StoreError::NotFound { entity: "user" };
        }
    }
    StoreError::Backend {
        reason: err.to_string(),
    }
}

/// Row type for user queries.
#[derive(FromRow)]
struct UserRow {
    id: String,
    email: String,
    role: String,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar: Option<String>,
    is_active: bool,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn try_into_user(self) -> Result<User, sqlx::Error> {
        let id = UserId::from_str(&self.id)
            .map_err(|e| invalid_data(format!("invalid user id '{}': {}", self.id, e)))?;
        let role = Role::from_str(&self.role)
            .map_err(|e| invalid_data(format!("invalid role for user {id}: {e}")))?;
        let password = match self.password_hash {
            Some(hash) => PasswordState::Set { hash },
            None => PasswordState::Unusable,
        };
        Ok(User::with_all_fields(
            id,
            self.email,
            role,
            self.first_name,
            self.last_name,
            self.avatar,
            self.is_active,
            password,
            self.created_at,
            self.updated_at,
        ))
    }
}

/// Row type for link queries.
#[derive(FromRow)]
struct LinkRow {
    id: String,
    user_id: String,
    provider: String,
    provider_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    reauth_required: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LinkRow {
    fn try_into_link(self) -> Result<SsoLink, sqlx::Error> {
        let id = SsoLinkId::from_str(&self.id)
            .map_err(|e| invalid_data(format!("invalid link id '{}': {}", self.id, e)))?;
        let user_id = UserId::from_str(&self.user_id)
            .map_err(|e| invalid_data(format!("invalid user id '{}': {}", self.user_id, e)))?;
        let provider = Provider::from_str(&self.provider)
            .map_err(|e| invalid_data(format!("invalid provider for link {id}: {e}")))?;
        Ok(SsoLink::with_all_fields(
            id,
            user_id,
            provider,
            self.provider_id,
            TokenSet::new(
                Secret::new(self.access_token),
                self.refresh_token.map(Secret::new),
                self.expires_at,
            ),
            self.reauth_required,
            self.created_at,
            self.updated_at,
        ))
    }
}

fn decode_links(rows: Vec<LinkRow>) -> Result<Vec<SsoLink>, StoreError> {
    let mut links = rows
        .into_iter()
        .map(LinkRow::try_into_link)
        .collect::<Result<Vec<_>, _>>()
        .map_err(store_error)?;
    links.sort_by_key(SsoLink::provider);
    Ok(links)
}

async fn insert_user<'e, E>(executor: E, user: &User) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO users (id, email, role, first_name, last_name, avatar, is_active, password_hash, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(user.id().to_string())
    .bind(user.email())
    .bind(user.role().as_str())
    .bind(user.first_name())
    .bind(user.last_name())
    .bind(user.avatar())
    .bind(user.is_active())
    .bind(user.password().hash_str())
    .bind(user.created_at())
    .bind(user.updated_at())
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_link<'e, E>(executor: E, link: &SsoLink) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO sso_links (id, user_id, provider, provider_id, access_token, refresh_token, expires_at, reauth_required, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(link.id().to_string())
    .bind(link.user_id().to_string())
    .bind(link.provider().as_str())
    .bind(link.provider_id())
    .bind(link.tokens().access_token().expose())
    .bind(link.tokens().refresh_token().map(Secret::expose))
    .bind(link.tokens().expires_at())
    .bind(link.reauth_required())
    .bind(link.created_at())
    .bind(link.updated_at())
    .execute(executor)
    .await?;

    Ok(())
}

async fn link_by_subject<'e, E>(
    executor: E,
    provider: Provider,
    provider_id: &str,
) -> Result<Option<SsoLink>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row: Option<LinkRow> = sqlx::query_as(
        r#"
        SELECT id, user_id, provider, provider_id, access_token, refresh_token, expires_at,
               reauth_required, created_at, updated_at
        FROM sso_links
        WHERE provider = $1 AND provider_id = $2
        "#,
    )
    .bind(provider.as_str())
    .bind(provider_id)
    .fetch_optional(executor)
    .await?;

    row.map(LinkRow::try_into_link).transpose()
}

/// User and link repository backed by PostgreSQL.
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgIdentityStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, email, role, first_name, last_name, avatar, is_active, password_hash,
                   created_at, updated_at
            FROM users
            WHERE lower(email) = $1
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(UserRow::try_into_user)
            .transpose()
            .map_err(store_error)
    }

    async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, email, role, first_name, last_name, avatar, is_active, password_hash,
                   created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(UserRow::try_into_user)
            .transpose()
            .map_err(store_error)
    }

    #[instrument(skip_all, fields(user_id = %user.id()))]
    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        insert_user(&self.pool, &user).await.map_err(store_error)?;
        Ok(user)
    }
}

#[async_trait]
impl LinkStore for PgIdentityStore {
    async fn get(
        &self,
        user_id: UserId,
        provider: Provider,
    ) -> Result<Option<SsoLink>, StoreError> {
        let row: Option<LinkRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider, provider_id, access_token, refresh_token, expires_at,
                   reauth_required, created_at, updated_at
            FROM sso_links
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id.to_string())
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(LinkRow::try_into_link)
            .transpose()
            .map_err(store_error)
    }

    async fn find_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> Result<Option<SsoLink>, StoreError> {
        link_by_subject(&self.pool, provider, provider_id)
            .await
            .map_err(store_error)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SsoLink>, StoreError> {
        let rows: Vec<LinkRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, provider, provider_id, access_token, refresh_token, expires_at,
                   reauth_required, created_at, updated_at
            FROM sso_links
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        decode_links(rows)
    }

    #[instrument(skip_all, fields(provider = %provider, user_id = %user_id))]
    async fn upsert_by_provider_subject(
        &self,
        provider: Provider,
        provider_id: &str,
        user_id: UserId,
        tokens: TokenSet,
    ) -> Result<Upserted, StoreError> {
        let link = SsoLink::new(user_id, provider, provider_id.to_string(), tokens);

        // Only the (provider, provider_id) conflict is absorbed here. A second
        // link for the same user and provider still raises a unique violation.
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO sso_links (id, user_id, provider, provider_id, access_token, refresh_token, expires_at, reauth_required, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider, provider_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(link.id().to_string())
        .bind(user_id.to_string())
        .bind(provider.as_str())
        .bind(provider_id)
        .bind(link.tokens().access_token().expose())
        .bind(link.tokens().refresh_token().map(Secret::expose))
        .bind(link.tokens().expires_at())
        .bind(link.reauth_required())
        .bind(link.created_at())
        .bind(link.updated_at())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        if inserted.is_some() {
            return Ok(Upserted {
                link,
                created: true,
            });
        }

        debug!("external identity already linked; fetching existing row");
        let existing = link_by_subject(&self.pool, provider, provider_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| StoreError::Conflict {
                reason: "link removed during upsert".to_string(),
            })?;
        Ok(Upserted {
            link: existing,
            created: false,
        })
    }

    #[instrument(skip_all, fields(provider = %provider, user_id = %user.id()))]
    async fn create_user_with_link(
        &self,
        user: User,
        provider: Provider,
        provider_id: &str,
        tokens: TokenSet,
    ) -> Result<AccountCreation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // Serializes account creation per external identity for the rest of
        // the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("sso:{provider}:{provider_id}"))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        if let Some(link) = link_by_subject(&mut *tx, provider, provider_id)
            .await
            .map_err(store_error)?
        {
            return Ok(AccountCreation::AlreadyLinked { link });
        }

        insert_user(&mut *tx, &user).await.map_err(store_error)?;
        let link = SsoLink::new(user.id(), provider, provider_id.to_string(), tokens);
        insert_link(&mut *tx, &link).await.map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        Ok(AccountCreation::Created { user, link })
    }

    #[instrument(skip_all, fields(link_id = %id))]
    async fn update_tokens(&self, id: SsoLinkId, tokens: TokenSet) -> Result<SsoLink, StoreError> {
        let row: Option<LinkRow> = sqlx::query_as(
            r#"
            UPDATE sso_links
            SET access_token = $2, refresh_token = $3, expires_at = $4,
                reauth_required = FALSE, updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, provider, provider_id, access_token, refresh_token, expires_at,
                      reauth_required, created_at, updated_at
            "#,
        )
        .bind(id.to_string())
        .bind(tokens.access_token().expose())
        .bind(tokens.refresh_token().map(Secret::expose))
        .bind(tokens.expires_at())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.ok_or(StoreError::NotFound { entity: "sso link" })?
            .try_into_link()
            .map_err(store_error)
    }

    #[instrument(skip_all, fields(link_id = %id))]
    async fn mark_reauth_required(&self, id: SsoLinkId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sso_links
            SET reauth_required = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "sso link" });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(link_id = %id))]
    async fn delete(&self, id: SsoLinkId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sso_links
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "sso link" });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(link_id = %id))]
    async fn delete_unless_last(&self, id: SsoLinkId) -> Result<LinkRemoval, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // Locking the owner row serializes unlinks of the same account until
        // commit.
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            SELECT u.id
            FROM users u
            JOIN sso_links l ON l.user_id = u.id
            WHERE l.id = $1
            FOR UPDATE OF u
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;
        let owner = owner.ok_or(StoreError::NotFound { entity: "sso link" })?;

        let result = sqlx::query(
            r#"
            DELETE FROM sso_links
            WHERE id = $1
              AND (SELECT COUNT(*) FROM sso_links WHERE user_id = $2) > 1
            "#,
        )
        .bind(id.to_string())
        .bind(&owner)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        if result.rows_affected() == 0 {
            debug!("kept the account's only link");
            return Ok(LinkRemoval::LastLink);
        }
        Ok(LinkRemoval::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_row(password_hash: Option<&str>) -> UserRow {
        let now = Utc::now();
        UserRow {
            id: UserId::new().to_string(),
            email: "ada@campus.edu".to_string(),
            role: "teacher".to_string(),
            first_name: Some("Ada".to_string()),
            last_name: None,
            avatar: None,
            is_active: true,
            password_hash: password_hash.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    fn link_row(provider: &str) -> LinkRow {
        let now = Utc::now();
        LinkRow {
            id: SsoLinkId::new().to_string(),
            user_id: UserId::new().to_string(),
            provider: provider.to_string(),
            provider_id: "kc-1".to_string(),
            access_token: "at".to_string(),
            refresh_token: None,
            expires_at: now,
            reauth_required: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn null_password_hash_disables_password_login() {
        let user = user_row(None).try_into_user().expect("decode");
        assert_eq!(user.password(), &PasswordState::Unusable);
        assert_eq!(user.role(), Role::Teacher);
    }

    #[test]
    fn stored_password_hash_is_kept() {
        let user = user_row(Some("$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"))
            .try_into_user()
            .expect("decode");
        assert!(user.has_usable_password());
    }

    #[test]
    fn unknown_role_fails_to_decode() {
        let mut row = user_row(None);
        row.role = "superuser".to_string();
        assert!(matches!(row.try_into_user(), Err(sqlx::Error::Decode(_))));
    }

    #[test]
    fn link_row_decodes_tokens_and_flag() {
        let link = link_row("keycloak").try_into_link().expect("decode");
        assert_eq!(link.provider(), Provider::Keycloak);
        assert_eq!(link.tokens().access_token().expose(), "at");
        assert!(link.tokens().refresh_token().is_none());
        assert!(link.reauth_required());
    }

    #[test]
    fn unknown_provider_fails_to_decode() {
        assert!(matches!(
            link_row("github").try_into_link(),
            Err(sqlx::Error::Decode(_))
        ));
    }

    #[test]
    fn links_are_listed_in_provider_order() {
        let links = decode_links(vec![link_row("google"), link_row("keycloak")]).expect("decode");
        let providers: Vec<_> = links.iter().map(SsoLink::provider).collect();
        assert_eq!(providers, vec![Provider::Keycloak, Provider::Google]);
    }

    #[test]
    fn non_database_errors_are_backend_failures() {
        assert!(matches!(
            store_error(sqlx::Error::RowNotFound),
            StoreError::Backend { .. }
        ));
    }
}

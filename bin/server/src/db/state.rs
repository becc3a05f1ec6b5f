//! PostgreSQL storage for pending authorization states.

use async_trait::async_trait;
use campus_sso_identity::state::REPLAY_RETENTION_HOURS;
use campus_sso_identity::{AuthorizationState, Provider, StateCheck, StateStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::{debug, instrument};

use super::identity::{invalid_data, store_error};

/// Row type for authorization state queries.
#[derive(FromRow)]
struct StateRow {
    state: String,
    provider: String,
    binding: String,
    pkce_verifier: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed_code: Option<String>,
}

impl StateRow {
    fn try_into_state(self) -> Result<AuthorizationState, sqlx::Error> {
        let provider = Provider::from_str(&self.provider)
            .map_err(|e| invalid_data(format!("invalid provider on authorization state: {e}")))?;
        Ok(AuthorizationState::with_all_fields(
            self.state,
            provider,
            self.binding,
            self.pkce_verifier,
            self.created_at,
            self.expires_at,
            self.consumed_code,
        ))
    }
}

/// Authorization state repository backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    #[instrument(skip_all, fields(provider = %state.provider()))]
    async fn issue(&self, state: AuthorizationState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sso_auth_states (state, provider, binding, pkce_verifier, created_at, expires_at, consumed_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(state.state())
        .bind(state.provider().as_str())
        .bind(state.binding())
        .bind(state.pkce_verifier())
        .bind(state.created_at())
        .bind(state.expires_at())
        .bind(state.consumed_code())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    #[instrument(skip_all, fields(provider = %provider))]
    async fn consume(
        &self,
        state: &str,
        binding: &str,
        provider: Provider,
        code_fingerprint: &str,
    ) -> Result<StateCheck, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // The row lock makes concurrent callbacks for the same state take turns,
        // so exactly one of them sees the state unconsumed.
        let row: Option<StateRow> = sqlx::query_as(
            r#"
            SELECT state, provider, binding, pkce_verifier, created_at, expires_at, consumed_code
            FROM sso_auth_states
            WHERE state = $1
            FOR UPDATE
            "#,
        )
        .bind(state)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            debug!("unknown authorization state");
            return Ok(StateCheck::Invalid);
        };
        let mut pending = row.try_into_state().map_err(store_error)?;
        let check = pending.check(binding, provider, code_fingerprint, Utc::now());

        if let StateCheck::Fresh(_) = &check {
            sqlx::query(
                r#"
                UPDATE sso_auth_states
                SET consumed_code = $2
                WHERE state = $1
                "#,
            )
            .bind(state)
            .bind(code_fingerprint)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;

        Ok(check)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sso_auth_states
            WHERE (consumed_code IS NULL AND expires_at < NOW())
               OR expires_at < NOW() - make_interval(hours => $1)
            "#,
        )
        .bind(REPLAY_RETENTION_HOURS as i32)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_sso_identity::state::code_fingerprint;
    use chrono::Duration;

    fn row(provider: &str, consumed_code: Option<String>) -> StateRow {
        let now = Utc::now();
        StateRow {
            state: "state-1".to_string(),
            provider: provider.to_string(),
            binding: "binding-a".to_string(),
            pkce_verifier: "verifier".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(10),
            consumed_code,
        }
    }

    #[test]
    fn decoded_state_keeps_consumed_fingerprint() {
        let fingerprint = code_fingerprint("code-1");
        let mut state = row("google", Some(fingerprint.clone()))
            .try_into_state()
            .expect("decode");

        assert_eq!(state.provider(), Provider::Google);
        assert_eq!(
            state.check("binding-a", Provider::Google, &fingerprint, Utc::now()),
            StateCheck::Replayed
        );
    }

    #[test]
    fn unknown_provider_fails_to_decode() {
        assert!(matches!(
            row("github", None).try_into_state(),
            Err(sqlx::Error::Decode(_))
        ));
    }
}

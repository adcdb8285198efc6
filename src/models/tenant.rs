use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::TenantId;

/// Created out-of-band; read-only to the core.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub brand_domain: String,
    pub sending_domain_base: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TenantRepository {
    pool: sqlx::PgPool,
}

impl TenantRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: TenantId) -> Result<Tenant, Error> {
        sqlx::query_as!(
            Tenant,
            r#"
            SELECT id as "id: TenantId", slug, brand_domain, sending_domain_base, active, created_at
            FROM tenants
            WHERE id = $1
            "#,
            *id
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Tenant, Error> {
        sqlx::query_as!(
            Tenant,
            r#"
            SELECT id as "id: TenantId", slug, brand_domain, sending_domain_base, active, created_at
            FROM tenants
            WHERE slug = $1
            "#,
            slug
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_active(&self) -> Result<Vec<Tenant>, Error> {
        sqlx::query_as!(
            Tenant,
            r#"
            SELECT id as "id: TenantId", slug, brand_domain, sending_domain_base, active, created_at
            FROM tenants
            WHERE active
            ORDER BY slug
            "#
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("tenants")))]
    async fn get_by_slug_and_id(db: PgPool) {
        let repo = TenantRepository::new(db);

        let by_slug = repo.get_by_slug("acme").await.unwrap();
        assert_eq!(by_slug.brand_domain, "acme.example.com");

        let by_id = repo.get_by_id(by_slug.id).await.unwrap();
        assert_eq!(by_id.slug, "acme");
    }

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("tenants")))]
    async fn list_active_excludes_inactive(db: PgPool) {
        let repo = TenantRepository::new(db);

        let active = repo.list_active().await.unwrap();
        assert!(active.iter().all(|t| t.active));
        assert!(active.iter().any(|t| t.slug == "acme"));
        assert!(!active.iter().any(|t| t.slug == "disabled-co"));
    }
}

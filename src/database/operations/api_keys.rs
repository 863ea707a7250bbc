// API key lookups
// The web layer owns issuance and revocation; this only maps a key digest to its plan

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::rate_limit::{Identity, Plan, PlanResolver, PlanTable};

pub struct PgPlanResolver {
    db: Arc<PgPool>,
    plans: PlanTable,
}

impl PgPlanResolver {
    pub fn new(db: Arc<PgPool>, plans: PlanTable) -> Self {
        Self { db, plans }
    }
}

#[async_trait]
impl PlanResolver for PgPlanResolver {
    async fn resolve(&self, identity: &Identity) -> Result<Option<Plan>> {
        let plan_name: Option<String> = sqlx::query_scalar(
            r#"
            SELECT plan
            FROM api_keys
            WHERE key_hash = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(identity.as_str())
        .fetch_optional(&*self.db)
        .await?;

        Ok(plan_name.map(|name| self.plans.get_or_default(&name)))
    }
}

//! Per-owner conversion credits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::InfraError;
use crate::jobs::OwnerRef;
use crate::store::Database;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Normal,
    Vip,
}

/// Whose credits a record holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum QuotaScope {
    Tenant(String),
    User(String),
}

impl QuotaScope {
    /// Tenant records take precedence over user records.
    pub fn for_owner(owner: &OwnerRef) -> Self {
        match owner.tenant_key() {
            Some(tenant) => Self::Tenant(tenant.to_string()),
            None => Self::User(owner.user_id.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tenant(_) => "tenant",
            Self::User(_) => "user",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Tenant(id) | Self::User(id) => id,
        }
    }
}

/// A block of conversion credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub id: Uuid,
    pub scope: QuotaScope,
    pub available_num: i64,
    pub is_enable: bool,
    pub user_type: UserType,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Output formats this owner may request. Empty means unrestricted.
    pub allowed_formats: Vec<String>,
    pub marks: Vec<String>,
    pub weight: i64,
    pub created_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn new(scope: QuotaScope, available_num: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            available_num,
            is_enable: true,
            user_type: UserType::Normal,
            valid_from: None,
            valid_until: None,
            allowed_formats: Vec::new(),
            marks: Vec::new(),
            weight: 0,
            created_at: Utc::now(),
        }
    }

    /// Enabled and inside its validity window.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_enable
            && self.valid_from.is_none_or(|from| from <= now)
            && self.valid_until.is_none_or(|until| now < until)
    }
}

/// Credit accounting consumed by admission.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Decrement `cost` credits if the owner has them. Owners without any
    /// record are unmetered.
    async fn check_and_consume(&self, owner: &OwnerRef, cost: u32) -> Result<bool, InfraError>;

    /// Lowercase output formats the owner may request; empty means any.
    async fn list_allowed_formats(&self, owner: &OwnerRef) -> Result<Vec<String>, InfraError>;

    async fn user_type(&self, owner: &OwnerRef) -> Result<UserType, InfraError>;

    /// Return credits for a job that ended in a failed status.
    async fn refund(&self, owner: &OwnerRef, cost: u32) -> Result<(), InfraError>;
}

/// `QuotaLedger` over the document store.
pub struct StoreQuotaLedger {
    store: Arc<dyn Database>,
}

impl StoreQuotaLedger {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    async fn eligible_records(&self, owner: &OwnerRef) -> Result<Option<Vec<QuotaRecord>>, InfraError> {
        let records = self.store.find_quotas(&QuotaScope::for_owner(owner)).await?;
        if records.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        Ok(Some(
            records.into_iter().filter(|r| r.is_eligible(now)).collect(),
        ))
    }
}

#[async_trait]
impl QuotaLedger for StoreQuotaLedger {
    async fn check_and_consume(&self, owner: &OwnerRef, cost: u32) -> Result<bool, InfraError> {
        let Some(records) = self.eligible_records(owner).await? else {
            debug!(owner = %owner, "No quota records, owner is unmetered");
            return Ok(true);
        };

        for record in records {
            if record.available_num < i64::from(cost) {
                continue;
            }
            // Another admission may have drained it since the read.
            if self.store.consume_quota(record.id, cost).await? {
                debug!(owner = %owner, quota_id = %record.id, cost, "Quota consumed");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_allowed_formats(&self, owner: &OwnerRef) -> Result<Vec<String>, InfraError> {
        let mut formats: Vec<String> = self
            .eligible_records(owner)
            .await?
            .unwrap_or_default()
            .into_iter()
            .flat_map(|r| r.allowed_formats)
            .map(|f| f.to_ascii_lowercase())
            .collect();
        formats.sort();
        formats.dedup();
        Ok(formats)
    }

    async fn user_type(&self, owner: &OwnerRef) -> Result<UserType, InfraError> {
        let vip = self
            .eligible_records(owner)
            .await?
            .unwrap_or_default()
            .iter()
            .any(|r| r.user_type == UserType::Vip);
        Ok(if vip { UserType::Vip } else { UserType::Normal })
    }

    async fn refund(&self, owner: &OwnerRef, cost: u32) -> Result<(), InfraError> {
        let records = self.eligible_records(owner).await?.unwrap_or_default();
        match records.first() {
            Some(record) => {
                self.store.refund_quota(record.id, cost).await?;
                debug!(owner = %owner, quota_id = %record.id, cost, "Quota refunded");
            }
            None => warn!(owner = %owner, "No eligible quota record to refund"),
        }
        Ok(())
    }
}

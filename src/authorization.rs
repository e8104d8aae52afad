//! Stored credentials per tenant and service.
use crate::db::{self, BlobTable, Pool};
use crate::error::PipeResult;
use crate::model::ServiceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authorization {
    pub workspace_id: i64,
    pub service_id: ServiceId,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Authorization {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[instrument(skip(pool))]
pub async fn load(
    pool: &Pool,
    workspace_id: i64,
    service_id: ServiceId,
) -> PipeResult<Option<Authorization>> {
    match db::select_blob(pool, BlobTable::Authorizations, workspace_id, service_id.as_str()).await?
    {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

#[instrument(skip_all, fields(workspace_id = auth.workspace_id, service = %auth.service_id))]
pub async fn save(pool: &Pool, auth: &Authorization) -> PipeResult<()> {
    let data = serde_json::to_string(auth)?;
    db::upsert_blob(
        pool,
        BlobTable::Authorizations,
        auth.workspace_id,
        auth.service_id.as_str(),
        &data,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn save_and_load() {
        let pool = db::memory_pool().await.unwrap();
        let auth = Authorization {
            workspace_id: 4,
            service_id: ServiceId::Asana,
            access_token: "tok".into(),
            refresh_token: Some("ref".into()),
            expires_at: None,
        };
        save(&pool, &auth).await.unwrap();
        assert_eq!(load(&pool, 4, ServiceId::Asana).await.unwrap(), Some(auth));
        assert_eq!(load(&pool, 4, ServiceId::Github).await.unwrap(), None);
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        let mut auth = Authorization {
            workspace_id: 1,
            service_id: ServiceId::Basecamp,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(!auth.is_expired(now));
        auth.expires_at = Some(now - Duration::minutes(1));
        assert!(auth.is_expired(now));
        auth.expires_at = Some(now + Duration::minutes(1));
        assert!(!auth.is_expired(now));
    }
}

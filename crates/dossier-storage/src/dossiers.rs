//! Dossier persistence. Bodies are write-once; only the Ask-Why cache grows.

use std::collections::HashMap;

use async_trait::async_trait;
use dossier_core::{ask_why_key, AskWhyAnswer, AskWhySection, Dossier, DossierSummary};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DossierStoreError {
    #[error("dossier {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} already has dossier {existing}")]
    DuplicateForJob { job_id: Uuid, existing: Uuid },
    #[error("dossier storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for DossierStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DossierStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("decoding dossier body: {err}"))
    }
}

#[async_trait]
pub trait DossierStore: Send + Sync {
    /// Rejects a second dossier for the same job.
    async fn insert(&self, dossier: &Dossier) -> Result<(), DossierStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Dossier>, DossierStoreError>;

    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<Dossier>, DossierStoreError>;

    /// Removes a dossier whose job was canceled before it could complete.
    async fn delete(&self, id: Uuid) -> Result<(), DossierStoreError>;

    /// Newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<DossierSummary>, DossierStoreError>;

    async fn cached_answer(
        &self,
        id: Uuid,
        section: AskWhySection,
        question_id: &str,
    ) -> Result<Option<AskWhyAnswer>, DossierStoreError>;

    /// Appends to the cache. First write wins; the stored answer is returned.
    async fn append_answer(
        &self,
        id: Uuid,
        answer: &AskWhyAnswer,
    ) -> Result<AskWhyAnswer, DossierStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDossierStore {
    dossiers: RwLock<HashMap<Uuid, Dossier>>,
}

impl MemoryDossierStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DossierStore for MemoryDossierStore {
    async fn insert(&self, dossier: &Dossier) -> Result<(), DossierStoreError> {
        let mut dossiers = self.dossiers.write().await;
        if let Some(existing) = dossiers.values().find(|d| d.job_id == dossier.job_id) {
            return Err(DossierStoreError::DuplicateForJob {
                job_id: dossier.job_id,
                existing: existing.id,
            });
        }
        dossiers.insert(dossier.id, dossier.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Dossier>, DossierStoreError> {
        Ok(self.dossiers.read().await.get(&id).cloned())
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<Dossier>, DossierStoreError> {
        Ok(self
            .dossiers
            .read()
            .await
            .values()
            .find(|d| d.job_id == job_id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), DossierStoreError> {
        self.dossiers
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(DossierStoreError::NotFound(id))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<DossierSummary>, DossierStoreError> {
        let dossiers = self.dossiers.read().await;
        let mut out = dossiers
            .values()
            .filter(|d| d.user_id == user_id)
            .map(Dossier::summary)
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.generated_at.cmp(&a.generated_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn cached_answer(
        &self,
        id: Uuid,
        section: AskWhySection,
        question_id: &str,
    ) -> Result<Option<AskWhyAnswer>, DossierStoreError> {
        let dossiers = self.dossiers.read().await;
        let dossier = dossiers.get(&id).ok_or(DossierStoreError::NotFound(id))?;
        Ok(dossier.ask_why.get(&ask_why_key(section, question_id)).cloned())
    }

    async fn append_answer(
        &self,
        id: Uuid,
        answer: &AskWhyAnswer,
    ) -> Result<AskWhyAnswer, DossierStoreError> {
        let mut dossiers = self.dossiers.write().await;
        let dossier = dossiers
            .get_mut(&id)
            .ok_or(DossierStoreError::NotFound(id))?;
        let stored = dossier
            .ask_why
            .entry(ask_why_key(answer.section, &answer.question_id))
            .or_insert_with(|| answer.clone());
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dossier_core::{
        ComparisonRow, DossierStatus, MarketAverage, PartyCell, PartyMetrics, PartyRef, VsMarket,
    };
    use std::collections::BTreeMap;

    fn empty_row() -> ComparisonRow {
        ComparisonRow {
            host: PartyCell {
                metrics: PartyMetrics {
                    count: 0,
                    priced: 0,
                    avg_price: None,
                },
                vs_market: VsMarket {
                    count: None,
                    avg_price: None,
                },
            },
            competitors: vec![],
            market_avg: MarketAverage {
                count: None,
                count_contributors: 0,
                avg_price: None,
                avg_price_contributors: 0,
            },
        }
    }

    fn dossier(user_id: &str, day: u32) -> Dossier {
        Dossier {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            generated_at: Utc.with_ymd_and_hms(2026, 10, day, 8, 0, 0).single().unwrap(),
            status: DossierStatus::Complete,
            host: PartyRef {
                name: "Host Motors".into(),
                url: "https://host.example".into(),
            },
            competitors: vec![],
            failed_targets: vec![],
            attempted_competitors: 0,
            tool_comparison: BTreeMap::new(),
            inventory_comparison: vec![],
            condition_totals: vec![],
            totals: empty_row(),
            ask_why: BTreeMap::new(),
        }
    }

    fn answer(text: &str) -> AskWhyAnswer {
        AskWhyAnswer {
            section: AskWhySection::Pricing,
            question_id: "overall_price_position".into(),
            question: "Why?".into(),
            answer: text.into(),
            factors: vec![],
        }
    }

    #[tokio::test]
    async fn one_dossier_per_job() {
        let store = MemoryDossierStore::new();
        let first = dossier("u1", 12);
        store.insert(&first).await.unwrap();

        let mut second = dossier("u1", 13);
        second.job_id = first.job_id;
        assert!(matches!(
            store.insert(&second).await,
            Err(DossierStoreError::DuplicateForJob { .. })
        ));
        assert_eq!(
            store.find_by_job(first.job_id).await.unwrap().map(|d| d.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn user_listing_is_newest_first_and_scoped() {
        let store = MemoryDossierStore::new();
        let old = dossier("u1", 5);
        let new = dossier("u1", 12);
        store.insert(&old).await.unwrap();
        store.insert(&new).await.unwrap();
        store.insert(&dossier("u2", 12)).await.unwrap();

        let listed = store.list_for_user("u1").await.unwrap();
        assert_eq!(listed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![new.id, old.id]);
    }

    #[tokio::test]
    async fn answer_cache_keeps_the_first_write() {
        let store = MemoryDossierStore::new();
        let d = dossier("u1", 12);
        store.insert(&d).await.unwrap();

        assert!(store
            .cached_answer(d.id, AskWhySection::Pricing, "overall_price_position")
            .await
            .unwrap()
            .is_none());
        let stored = store.append_answer(d.id, &answer("first")).await.unwrap();
        assert_eq!(stored.answer, "first");
        let again = store.append_answer(d.id, &answer("second")).await.unwrap();
        assert_eq!(again.answer, "first");

        store.delete(d.id).await.unwrap();
        assert!(store.get(d.id).await.unwrap().is_none());
    }
}

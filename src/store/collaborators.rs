//! Store-backed collaborator implementations.
//!
//! The CRM is a monolith: contacts/projects live in the same database, so
//! the default pipeline, calendar, and directory collaborators are thin
//! reads over the subjects table. The engine core still only sees the
//! `collab` traits, so deployments that split these services swap the
//! implementation, not the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::automation::model::AnchorEvent;
use crate::collab::{EventCalendar, Pipeline, SubjectDirectory, SubjectProfile};
use crate::error::CollabError;
use crate::store::Store;

/// Pipeline, calendar, and directory collaborators backed by the store.
#[derive(Clone)]
pub struct StoreCollaborators {
    store: Arc<dyn Store>,
}

impl StoreCollaborators {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn lookup_err(service: &str, e: impl std::fmt::Display) -> CollabError {
    CollabError::Lookup {
        service: service.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl Pipeline for StoreCollaborators {
    async fn subject_stage(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<Uuid>, CollabError> {
        let subject = self
            .store
            .get_subject(tenant_id, subject_id)
            .await
            .map_err(|e| lookup_err("pipeline", e))?;
        Ok(subject.and_then(|s| s.stage_id))
    }

    async fn update_subject_stage(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        stage_id: Uuid,
    ) -> Result<(), CollabError> {
        let mut subject = self
            .store
            .get_subject(tenant_id, subject_id)
            .await
            .map_err(|e| lookup_err("pipeline", e))?
            .ok_or_else(|| CollabError::Lookup {
                service: "pipeline".to_string(),
                reason: format!("subject {subject_id} not found"),
            })?;

        subject.stage_id = Some(stage_id);
        self.store
            .upsert_subject(&subject)
            .await
            .map_err(|e| lookup_err("pipeline", e))
    }
}

#[async_trait]
impl EventCalendar for StoreCollaborators {
    async fn anchor_date(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        anchor: AnchorEvent,
    ) -> Result<Option<NaiveDate>, CollabError> {
        let subject = self
            .store
            .get_subject(tenant_id, subject_id)
            .await
            .map_err(|e| lookup_err("calendar", e))?;
        Ok(subject.and_then(|s| match anchor {
            AnchorEvent::WeddingDate => s.wedding_date,
            AnchorEvent::SessionDate => s.session_date,
        }))
    }

    async fn subjects_with_event_between(
        &self,
        tenant_id: Uuid,
        anchor: AnchorEvent,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(Uuid, NaiveDate)>, CollabError> {
        self.store
            .list_subjects_with_event_between(tenant_id, anchor, from, to)
            .await
            .map_err(|e| lookup_err("calendar", e))
    }
}

#[async_trait]
impl SubjectDirectory for StoreCollaborators {
    async fn profile(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<SubjectProfile>, CollabError> {
        let Some(subject) = self
            .store
            .get_subject(tenant_id, subject_id)
            .await
            .map_err(|e| lookup_err("directory", e))?
        else {
            return Ok(None);
        };

        let mut fields = subject.fields;
        if let Some(date) = subject.wedding_date {
            fields.insert("wedding_date".to_string(), date.format("%B %-d, %Y").to_string());
        }
        if let Some(date) = subject.session_date {
            fields.insert("session_date".to_string(), date.format("%B %-d, %Y").to_string());
        }

        Ok(Some(SubjectProfile {
            first_name: subject.first_name,
            email: subject.email,
            phone: subject.phone,
            fields,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlStore, SubjectRecord};
    use std::collections::HashMap;

    async fn seeded() -> (StoreCollaborators, Uuid, Uuid) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let tenant = Uuid::new_v4();
        let subject = SubjectRecord {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            first_name: Some("Maya".to_string()),
            email: Some("maya@example.com".to_string()),
            phone: Some("+15551234".to_string()),
            stage_id: Some(Uuid::new_v4()),
            project_type: Some("wedding".to_string()),
            wedding_date: NaiveDate::from_ymd_opt(2025, 6, 14),
            session_date: None,
            fields: HashMap::new(),
        };
        store.upsert_subject(&subject).await.unwrap();
        (StoreCollaborators::new(store), tenant, subject.id)
    }

    #[tokio::test]
    async fn stage_read_and_update() {
        let (collab, tenant, subject_id) = seeded().await;
        assert!(collab.subject_stage(tenant, subject_id).await.unwrap().is_some());

        let new_stage = Uuid::new_v4();
        collab
            .update_subject_stage(tenant, subject_id, new_stage)
            .await
            .unwrap();
        assert_eq!(
            collab.subject_stage(tenant, subject_id).await.unwrap(),
            Some(new_stage)
        );
    }

    #[tokio::test]
    async fn anchor_dates_by_event_type() {
        let (collab, tenant, subject_id) = seeded().await;
        let wedding = collab
            .anchor_date(tenant, subject_id, AnchorEvent::WeddingDate)
            .await
            .unwrap();
        assert_eq!(wedding, NaiveDate::from_ymd_opt(2025, 6, 14));

        let session = collab
            .anchor_date(tenant, subject_id, AnchorEvent::SessionDate)
            .await
            .unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn profile_includes_event_dates_as_merge_fields() {
        let (collab, tenant, subject_id) = seeded().await;
        let profile = collab.profile(tenant, subject_id).await.unwrap().unwrap();
        assert_eq!(profile.merge_field("first_name"), Some("Maya"));
        assert_eq!(profile.merge_field("wedding_date"), Some("June 14, 2025"));
    }

    #[tokio::test]
    async fn event_window_scan() {
        let (collab, tenant, subject_id) = seeded().await;
        let hits = collab
            .subjects_with_event_between(
                tenant,
                AnchorEvent::WeddingDate,
                NaiveDate::from_ymd_opt(2025, 6, 7).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 14).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, subject_id);

        let misses = collab
            .subjects_with_event_between(
                tenant,
                AnchorEvent::WeddingDate,
                NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 7, 31).unwrap(),
            )
            .await
            .unwrap();
        assert!(misses.is_empty());
    }
}

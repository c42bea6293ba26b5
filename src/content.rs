//! Content resolution — template lookup and merge-field rendering.
//!
//! Inline content is used as-is; template references are loaded from the
//! store at dispatch time so edits apply to not-yet-sent work. Merge-field
//! tokens (`{{first_name}}`) are substituted from the subject profile;
//! unresolvable tokens render as empty strings, never errors.

use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use crate::automation::model::Content;
use crate::channels::ResolvedContent;
use crate::collab::SubjectProfile;
use crate::error::RuleError;
use crate::store::Store;

/// Resolves rule content into sendable text.
pub struct ContentResolver {
    store: Arc<dyn Store>,
    token: Regex,
}

impl ContentResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            token: Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid merge token regex"),
        }
    }

    /// Resolve content for one subject: load the template if referenced,
    /// then render merge fields from the profile.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        content: &Content,
        profile: &SubjectProfile,
    ) -> Result<ResolvedContent, RuleError> {
        let (subject, body) = match content {
            Content::Inline { subject, body } => (subject.clone(), body.clone()),
            Content::Template { template_id } => {
                let template = self
                    .store
                    .get_template(tenant_id, *template_id)
                    .await
                    .ok()
                    .flatten()
                    .ok_or(RuleError::TemplateNotFound {
                        template_id: *template_id,
                    })?;
                (template.subject, template.body)
            }
        };

        Ok(ResolvedContent {
            subject: subject.map(|s| self.render(&s, profile)),
            body: self.render(&body, profile),
        })
    }

    /// Substitute `{{field}}` tokens from the profile.
    pub fn render(&self, text: &str, profile: &SubjectProfile) -> String {
        self.token
            .replace_all(text, |caps: &regex::Captures<'_>| {
                profile.merge_field(&caps[1]).unwrap_or("").to_string()
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlStore, MessageTemplate};
    use chrono::Utc;
    use std::collections::HashMap;

    async fn resolver() -> (ContentResolver, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        (ContentResolver::new(store.clone()), store)
    }

    fn profile() -> SubjectProfile {
        let mut fields = HashMap::new();
        fields.insert("studio_name".to_string(), "Golden Hour Co".to_string());
        SubjectProfile {
            first_name: Some("Maya".to_string()),
            email: Some("maya@example.com".to_string()),
            phone: None,
            fields,
        }
    }

    #[tokio::test]
    async fn renders_merge_fields() {
        let (resolver, _) = resolver().await;
        let rendered = resolver.render("Hi {{first_name}}, from {{ studio_name }}!", &profile());
        assert_eq!(rendered, "Hi Maya, from Golden Hour Co!");
    }

    #[tokio::test]
    async fn unknown_fields_render_empty() {
        let (resolver, _) = resolver().await;
        let rendered = resolver.render("Hello {{nickname}}!", &profile());
        assert_eq!(rendered, "Hello !");
    }

    #[tokio::test]
    async fn inline_content_resolves_without_store() {
        let (resolver, _) = resolver().await;
        let content = Content::Inline {
            subject: Some("Welcome {{first_name}}".to_string()),
            body: "Thanks for reaching out.".to_string(),
        };
        let resolved = resolver
            .resolve(Uuid::new_v4(), &content, &profile())
            .await
            .unwrap();
        assert_eq!(resolved.subject.as_deref(), Some("Welcome Maya"));
        assert_eq!(resolved.body, "Thanks for reaching out.");
    }

    #[tokio::test]
    async fn template_content_loads_and_renders() {
        let (resolver, store) = resolver().await;
        let tenant = Uuid::new_v4();
        let template = MessageTemplate {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "welcome".to_string(),
            subject: Some("Hello {{first_name}}".to_string()),
            body: "We can't wait to work with you, {{first_name}}.".to_string(),
            created_at: Utc::now(),
        };
        store.create_template(&template).await.unwrap();

        let content = Content::Template {
            template_id: template.id,
        };
        let resolved = resolver.resolve(tenant, &content, &profile()).await.unwrap();
        assert_eq!(resolved.subject.as_deref(), Some("Hello Maya"));
        assert!(resolved.body.contains("Maya"));
    }

    #[tokio::test]
    async fn missing_template_is_rule_error() {
        let (resolver, _) = resolver().await;
        let content = Content::Template {
            template_id: Uuid::new_v4(),
        };
        let result = resolver.resolve(Uuid::new_v4(), &content, &profile()).await;
        assert!(matches!(result, Err(RuleError::TemplateNotFound { .. })));
    }
}

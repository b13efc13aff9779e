//! Customization tracking - which syncable fields the user has taken over
//!
//! A syncable field follows upstream until the user edits it away from the
//! stored value. From then on it is `UserEdited` and the reconciler leaves it
//! alone, until [`reset_field`] hands it back to upstream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

use crate::github::{ProviderError, RepoProvider, UpstreamRepo};
use crate::store::ProjectStore;

/// Project fields that may come from upstream and may be overridden locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncableField {
    Title,
    Description,
}

impl SyncableField {
    pub const ALL: [SyncableField; 2] = [SyncableField::Title, SyncableField::Description];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncableField::Title => "title",
            SyncableField::Description => "description",
        }
    }

    /// Value this field takes from an upstream repository
    pub fn upstream_value(&self, repo: &UpstreamRepo) -> String {
        match self {
            SyncableField::Title => repo.name.clone(),
            SyncableField::Description => repo.description.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for SyncableField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncableField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "title" => Ok(SyncableField::Title),
            "description" => Ok(SyncableField::Description),
            other => Err(format!(
                "'{}' is not a syncable field (expected title or description)",
                other
            )),
        }
    }
}

/// Where a syncable field's current value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Synced,
    UserEdited,
}

/// Ordered set of customized fields, in the order they were first edited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomizedFields(Vec<SyncableField>);

impl CustomizedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, field: SyncableField) -> bool {
        self.0.contains(&field)
    }

    pub fn provenance(&self, field: SyncableField) -> Provenance {
        if self.contains(field) {
            Provenance::UserEdited
        } else {
            Provenance::Synced
        }
    }

    /// Mark a field; returns false if it was already marked
    pub fn insert(&mut self, field: SyncableField) -> bool {
        if self.contains(field) {
            return false;
        }
        self.0.push(field);
        true
    }

    /// Unmark a field; returns false if it was not marked
    pub fn remove(&mut self, field: SyncableField) -> bool {
        let before = self.0.len();
        self.0.retain(|f| *f != field);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = SyncableField> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<SyncableField> for CustomizedFields {
    fn from_iter<I: IntoIterator<Item = SyncableField>>(iter: I) -> Self {
        let mut fields = CustomizedFields::new();
        for field in iter {
            fields.insert(field);
        }
        fields
    }
}

/// Stored values of the syncable fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncableValues {
    pub title: String,
    pub description: String,
}

impl SyncableValues {
    pub fn get(&self, field: SyncableField) -> &str {
        match field {
            SyncableField::Title => &self.title,
            SyncableField::Description => &self.description,
        }
    }
}

/// A user edit; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldEdits {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl FieldEdits {
    pub fn get(&self, field: SyncableField) -> Option<&str> {
        match field {
            SyncableField::Title => self.title.as_deref(),
            SyncableField::Description => self.description.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

/// Fold an edit into the customized set.
///
/// A field is added when the incoming value differs from the stored one and it
/// is not already customized. Fields are never removed here.
pub fn compute_customized_fields(
    existing: &CustomizedFields,
    prior: &SyncableValues,
    new: &FieldEdits,
) -> CustomizedFields {
    let mut updated = existing.clone();

    for field in SyncableField::ALL {
        if let Some(incoming) = new.get(field) {
            if incoming != prior.get(field) && !existing.contains(field) {
                updated.insert(field);
            }
        }
    }

    updated
}

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error("project {0} is not linked to a GitHub repository")]
    NotSynced(i64),

    #[error("could not fetch upstream value: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Hand a field back to upstream: fetch the authoritative value, store it and
/// drop the field from the customized set. Returns the new value.
pub async fn reset_field(
    store: &ProjectStore,
    provider: &dyn RepoProvider,
    project_id: i64,
    field: SyncableField,
) -> Result<String, ResetError> {
    let project = store
        .get_project(project_id)?
        .ok_or(ResetError::ProjectNotFound(project_id))?;

    let link = project
        .github_link()
        .ok_or(ResetError::NotSynced(project_id))?;

    let upstream = provider.fetch_repo(&link.full_name).await?;
    let value = field.upstream_value(&upstream);

    store.reset_field_value(project_id, field, &value)?;

    info!(
        "Reset {} of project {} to upstream value from {}",
        field, project_id, link.full_name
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn values(title: &str, description: &str) -> SyncableValues {
        SyncableValues {
            title: title.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn edit_that_changes_title_marks_it() {
        let updated = compute_customized_fields(
            &CustomizedFields::new(),
            &values("repo", "desc"),
            &FieldEdits {
                title: Some("My Repo".to_string()),
                description: Some("desc".to_string()),
            },
        );

        assert!(updated.contains(SyncableField::Title));
        assert!(!updated.contains(SyncableField::Description));
        assert_eq!(updated.provenance(SyncableField::Title), Provenance::UserEdited);
        assert_eq!(updated.provenance(SyncableField::Description), Provenance::Synced);
    }

    #[test]
    fn unchanged_values_do_not_mark() {
        let updated = compute_customized_fields(
            &CustomizedFields::new(),
            &values("repo", "desc"),
            &FieldEdits {
                title: Some("repo".to_string()),
                description: None,
            },
        );
        assert!(updated.is_empty());
    }

    #[test]
    fn customization_is_sticky() {
        let existing: CustomizedFields = [SyncableField::Description].into_iter().collect();

        // editing back to the stored value never un-customizes
        let updated = compute_customized_fields(
            &existing,
            &values("repo", "mine"),
            &FieldEdits {
                title: None,
                description: Some("mine".to_string()),
            },
        );
        assert_eq!(updated, existing);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut fields = CustomizedFields::new();
        assert!(fields.insert(SyncableField::Description));
        assert!(fields.insert(SyncableField::Title));
        assert!(!fields.insert(SyncableField::Description));

        let order: Vec<_> = fields.iter().collect();
        assert_eq!(order, vec![SyncableField::Description, SyncableField::Title]);

        assert!(fields.remove(SyncableField::Description));
        assert!(!fields.remove(SyncableField::Description));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn serializes_as_field_name_array() {
        let fields: CustomizedFields = [SyncableField::Title, SyncableField::Description]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"["title","description"]"#);

        let parsed: CustomizedFields = serde_json::from_str(r#"["description"]"#).unwrap();
        assert!(parsed.contains(SyncableField::Description));
        assert!(serde_json::from_str::<CustomizedFields>(r#"["stars"]"#).is_err());
    }

    #[test]
    fn parses_field_names() {
        assert_eq!("Title".parse::<SyncableField>().unwrap(), SyncableField::Title);
        assert_eq!(" description ".parse::<SyncableField>().unwrap(), SyncableField::Description);
        assert!("language".parse::<SyncableField>().is_err());
    }

    #[quickcheck]
    fn never_forgets_a_customized_field(title: String, description: String, edit: Option<String>) -> bool {
        let existing: CustomizedFields = [SyncableField::Title].into_iter().collect();
        let updated = compute_customized_fields(
            &existing,
            &values(&title, &description),
            &FieldEdits {
                title: edit.clone(),
                description: edit,
            },
        );
        updated.contains(SyncableField::Title)
    }
}

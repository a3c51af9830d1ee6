//! Consolidation of sheet revisions into composite sheets.
//!
//! Revisions are grouped by case-insensitive name and owning company. The newest revision
//! of a group is its latest revision; every revision's external id maps to the one canonical
//! sheet id, so answers given on any historical revision land on the same parent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use qmig_adapters::{SheetSource, Validated};
use qmig_core::{CanonicalEntity, EntityType, SheetRow, TargetRow};
use tracing::debug;
use uuid::Uuid;

use crate::identity::IdentityMap;
use crate::transform::{resolve_optional, resolve_required, TransformError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SheetGroupKey {
    pub normalized_name: String,
    pub company_external_id: String,
}

impl SheetGroupKey {
    pub fn of(sheet: &SheetSource) -> Self {
        Self {
            normalized_name: normalize_name(&sheet.name),
            company_external_id: sheet.company.clone(),
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Revisions of one logical sheet, newest first.
#[derive(Debug, Clone)]
pub struct RevisionGroup {
    pub key: SheetGroupKey,
    pub revisions: Vec<Validated<SheetSource>>,
}

impl RevisionGroup {
    pub fn latest(&self) -> &Validated<SheetSource> {
        &self.revisions[0]
    }

    pub fn external_ids(&self) -> Vec<String> {
        self.revisions.iter().map(|r| r.external_id.clone()).collect()
    }

    pub fn version_count(&self) -> usize {
        self.revisions.len()
    }

    /// Tag external ids across all revisions, deduplicated and sorted.
    pub fn tag_union(&self) -> Vec<String> {
        self.revisions
            .iter()
            .flat_map(|r| r.body.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Latest revision external id per canonical sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionIndex {
    latest: HashMap<Uuid, String>,
}

impl RevisionIndex {
    pub fn from_map(latest: HashMap<Uuid, String>) -> Self {
        Self { latest }
    }

    pub fn insert(&mut self, sheet_id: Uuid, latest_external_id: impl Into<String>) {
        self.latest.insert(sheet_id, latest_external_id.into());
    }

    pub fn latest_external_id_for(&self, sheet_id: Uuid) -> Option<&str> {
        self.latest.get(&sheet_id).map(String::as_str)
    }

    pub fn extend(&mut self, other: RevisionIndex) {
        self.latest.extend(other.latest);
    }

    pub fn sheet_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.latest.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

pub struct RevisionResolver {
    groups: Vec<RevisionGroup>,
    index: RevisionIndex,
}

impl RevisionResolver {
    /// Groups raw revisions. Order within a group is `(modified_at, external_id)` descending,
    /// so the result does not depend on fetch order.
    pub fn group(revisions: Vec<Validated<SheetSource>>) -> Self {
        let mut by_key: BTreeMap<SheetGroupKey, Vec<Validated<SheetSource>>> = BTreeMap::new();
        for revision in revisions {
            by_key
                .entry(SheetGroupKey::of(&revision.body))
                .or_default()
                .push(revision);
        }
        let groups = by_key
            .into_iter()
            .map(|(key, mut revisions)| {
                revisions.sort_by(|a, b| {
                    (b.modified_at, &b.external_id).cmp(&(a.modified_at, &a.external_id))
                });
                RevisionGroup { key, revisions }
            })
            .collect();
        Self {
            groups,
            index: RevisionIndex::default(),
        }
    }

    pub fn groups(&self) -> &[RevisionGroup] {
        &self.groups
    }

    pub fn revision_count(&self) -> usize {
        self.groups.iter().map(RevisionGroup::version_count).sum()
    }

    /// The canonical id already assigned to any revision of the group, preferring the newest.
    pub async fn existing_id(
        identity: &IdentityMap,
        group: &RevisionGroup,
    ) -> Result<Option<Uuid>, TransformError> {
        let external_ids = group.external_ids();
        let found = identity.get_batch(EntityType::Sheet, &external_ids).await?;
        Ok(external_ids.iter().find_map(|ext| found.get(ext).copied()))
    }

    /// Whether every revision of the group already has a mapping.
    pub async fn is_fully_migrated(
        identity: &IdentityMap,
        group: &RevisionGroup,
    ) -> Result<bool, TransformError> {
        let external_ids = group.external_ids();
        let found = identity.get_batch(EntityType::Sheet, &external_ids).await?;
        Ok(found.len() == external_ids.len())
    }

    /// Builds the composite sheet for one group.
    pub async fn resolve_group(
        identity: &IdentityMap,
        group: &RevisionGroup,
    ) -> Result<CanonicalEntity, TransformError> {
        let latest = group.latest();
        let tag_external_ids = group.tag_union();
        let (existing, company_id, created_by, tags) = futures::try_join!(
            Self::existing_id(identity, group),
            resolve_required(identity, EntityType::Company, &latest.body.company),
            resolve_optional(identity, EntityType::User, latest.body.created_by.as_deref()),
            async {
                identity
                    .get_batch(EntityType::Tag, &tag_external_ids)
                    .await
                    .map_err(TransformError::from)
            },
        )?;

        let tag_ids: Vec<Uuid> = tag_external_ids
            .iter()
            .filter_map(|ext| {
                let id = tags.get(ext).copied();
                if id.is_none() {
                    debug!(tag = %ext, sheet = %latest.external_id, "dropping unresolved sheet tag");
                }
                id
            })
            .collect();

        let row = SheetRow {
            id: existing.unwrap_or_else(Uuid::new_v4),
            company_id,
            name: latest.body.name.clone(),
            status: latest.body.status.clone(),
            created_by,
            latest_external_id: latest.external_id.clone(),
            version_count: i32::try_from(group.version_count()).unwrap_or(i32::MAX),
            tag_ids,
            modified_at: latest.modified_at,
        };
        Ok(CanonicalEntity::composite(group.external_ids(), TargetRow::Sheet(row)))
    }

    /// Records the latest revision of a resolved group.
    pub fn record_latest(&mut self, sheet_id: Uuid, group_index: usize) {
        if let Some(group) = self.groups.get(group_index) {
            self.index.insert(sheet_id, group.latest().external_id.clone());
        }
    }

    pub fn latest_external_id_for(&self, sheet_id: Uuid) -> Option<&str> {
        self.index.latest_external_id_for(sheet_id)
    }

    pub fn into_index(self) -> RevisionIndex {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use qmig_storage::{MemoryMappingStore, RetryPolicy};

    fn revision(id: &str, name: &str, company: &str, day: u32, tags: &[&str]) -> Validated<SheetSource> {
        Validated {
            external_id: id.to_string(),
            modified_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().expect("date"),
            created_at: None,
            body: SheetSource {
                name: name.to_string(),
                company: company.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                status: None,
                created_by: None,
            },
        }
    }

    #[test]
    fn groups_by_case_insensitive_name_and_company() {
        let resolver = RevisionResolver::group(vec![
            revision("r1", "Widget A", "c1", 1, &[]),
            revision("r2", "widget  a", "c1", 2, &[]),
            revision("r3", "Widget A", "c2", 1, &[]),
        ]);
        assert_eq!(resolver.groups().len(), 2);
        let group = resolver
            .groups()
            .iter()
            .find(|g| g.key.company_external_id == "c1")
            .expect("c1 group");
        assert_eq!(group.version_count(), 2);
        assert_eq!(group.latest().external_id, "r2");
    }

    #[test]
    fn tag_union_spans_revisions() {
        let resolver = RevisionResolver::group(vec![
            revision("r1", "S", "c1", 1, &["t1", "t2"]),
            revision("r2", "S", "c1", 2, &["t2", "t3"]),
        ]);
        assert_eq!(resolver.groups()[0].tag_union(), vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn composite_sheet_reuses_any_revision_mapping() {
        let identity = IdentityMap::new(Arc::new(MemoryMappingStore::new()), RetryPolicy::default());
        let company = Uuid::new_v4();
        let existing = Uuid::new_v4();
        identity.set(EntityType::Company, "c1", company).await.expect("company");
        identity.set(EntityType::Sheet, "r1", existing).await.expect("old revision");
        identity.set(EntityType::Tag, "t1", Uuid::new_v4()).await.expect("tag");

        let mut resolver = RevisionResolver::group(vec![
            revision("r1", "Widget A", "c1", 1, &["t1"]),
            revision("r2", "Widget A", "c1", 2, &["t1", "t-missing"]),
        ]);
        let group = resolver.groups()[0].clone();
        let entity = RevisionResolver::resolve_group(&identity, &group).await.expect("resolve");
        assert_eq!(entity.internal_id, existing);
        assert_eq!(entity.external_ids, vec!["r2".to_string(), "r1".to_string()]);
        match &entity.row {
            TargetRow::Sheet(row) => {
                assert_eq!(row.version_count, 2);
                assert_eq!(row.latest_external_id, "r2");
                assert_eq!(row.company_id, company);
                assert_eq!(row.tag_ids.len(), 1);
            }
            other => panic!("unexpected row {other:?}"),
        }

        resolver.record_latest(entity.internal_id, 0);
        assert_eq!(resolver.latest_external_id_for(existing), Some("r2"));
    }

    #[tokio::test]
    async fn unresolved_company_fails_the_group() {
        let identity = IdentityMap::new(Arc::new(MemoryMappingStore::new()), RetryPolicy::default());
        let resolver = RevisionResolver::group(vec![revision("r1", "S", "c-missing", 1, &[])]);
        let err = RevisionResolver::resolve_group(&identity, &resolver.groups()[0])
            .await
            .expect_err("no company");
        assert!(matches!(err, TransformError::FkUnresolved { .. }));
    }
}

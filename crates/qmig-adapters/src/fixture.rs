use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use qmig_core::EntityType;
use qmig_storage::{FetchError, RecordSource, SourcePage};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Serves source records from `<dir>/<entity>.json`, paginated like the live API.
///
/// Files hold either a bare JSON array or the API envelope `{"response": {"results": [...]}}`.
/// A missing file reads as an empty entity type.
pub struct FixtureRecordSource {
    dir: PathBuf,
    loaded: Mutex<HashMap<EntityType, Arc<Vec<JsonValue>>>>,
}

impl FixtureRecordSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fixture_path(&self, entity: EntityType) -> PathBuf {
        self.dir.join(format!("{}.json", entity.as_str()))
    }

    fn records(&self, entity: EntityType) -> Result<Arc<Vec<JsonValue>>> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(records) = loaded.get(&entity) {
            return Ok(Arc::clone(records));
        }
        let records = Arc::new(read_fixture_file(&self.fixture_path(entity))?);
        debug!(%entity, count = records.len(), dir = %self.dir.display(), "loaded fixture records");
        loaded.insert(entity, Arc::clone(&records));
        Ok(records)
    }
}

fn read_fixture_file(path: &Path) -> Result<Vec<JsonValue>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut envelope) => match envelope.remove("response") {
            Some(JsonValue::Object(mut response)) => match response.remove("results") {
                Some(JsonValue::Array(items)) => Ok(items),
                _ => anyhow::bail!("{}: response envelope has no results array", path.display()),
            },
            _ => anyhow::bail!("{}: expected an array or a response envelope", path.display()),
        },
        _ => anyhow::bail!("{}: expected an array or a response envelope", path.display()),
    }
}

#[async_trait]
impl RecordSource for FixtureRecordSource {
    async fn fetch_page(
        &self,
        entity: EntityType,
        cursor: u64,
        limit: u32,
    ) -> Result<SourcePage, FetchError> {
        let records = self
            .records(entity)
            .map_err(|e| FetchError::Unavailable(format!("{e:#}")))?;
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(records.len());
        let end = start.saturating_add(limit.max(1) as usize).min(records.len());
        Ok(SourcePage {
            items: records[start..end].to_vec(),
            remaining: (records.len() - end) as i64,
        })
    }
}

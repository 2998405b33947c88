use crate::record::ExecutionRecord;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// On-disk store for execution records, one JSON document per record.
///
/// Layout:
/// ```text
/// <base>/<record_id>.json
/// ```
///
/// Every write goes through a temp file and an atomic rename so a reader
/// (or a crash) never observes a half-written document.
pub struct RecordStorage {
    base_path: PathBuf,
}

impl RecordStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn record_path(&self, id: Uuid) -> PathBuf {
        self.base_path.join(format!("{}.json", id))
    }

    pub fn save(&self, record: &ExecutionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.base_path).context("Failed to create records directory")?;

        let json = serde_json::to_string_pretty(record).context("Failed to serialize record")?;
        let final_path = self.record_path(record.id);
        let tmp_path = self.base_path.join(format!("{}.json.tmp", record.id));

        std::fs::write(&tmp_path, json).context("Failed to write record temp file")?;
        std::fs::rename(&tmp_path, &final_path).context("Failed to replace record file")?;
        Ok(())
    }

    pub fn load(&self, id: Uuid) -> Result<ExecutionRecord> {
        let path = self.record_path(id);
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&data).context("Failed to parse record")
    }

    /// Load every record in the store, oldest first. Files that do not
    /// parse are skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<ExecutionRecord>> {
        if !self.base_path.exists() {
            return Ok(vec![]);
        }

        let mut records = Vec::new();
        for entry in
            std::fs::read_dir(&self.base_path).context("Failed to read records directory")?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|data| serde_json::from_str(&data).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }

        records.sort_by(|a: &ExecutionRecord, b: &ExecutionRecord| {
            a.started_at.cmp(&b.started_at)
        });
        Ok(records)
    }

    /// Persist a step's screenshot next to its record, returning the path.
    ///
    /// Layout: `<base>/<record_id>/step_<n>.jpg`.
    pub fn save_step_screenshot(&self, id: Uuid, step: u32, jpeg: &[u8]) -> Result<PathBuf> {
        let dir = self.base_path.join(id.to_string());
        std::fs::create_dir_all(&dir).context("Failed to create screenshot directory")?;
        let path = dir.join(format!("step_{}.jpg", step));
        std::fs::write(&path, jpeg).context("Failed to write step screenshot")?;
        Ok(path)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordStatus, ScreenClass, StepRecord};

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());

        let mut record = ExecutionRecord::new("open settings");
        record.push_step(StepRecord::new(1, ScreenClass::Ok));
        storage.save(&record).unwrap();

        let loaded = storage.load(record.id).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn save_is_replace_not_append() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());

        let mut record = ExecutionRecord::new("open settings");
        storage.save(&record).unwrap();
        record.push_step(StepRecord::new(1, ScreenClass::Ok));
        record.finish(RecordStatus::Completed, Some("done".to_string()));
        storage.save(&record).unwrap();

        let loaded = storage.load(record.id).unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.status, RecordStatus::Completed);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());
        storage.save(&ExecutionRecord::new("task")).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn list_returns_records_sorted_by_start() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());

        let mut first = ExecutionRecord::new("first");
        first.started_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let second = ExecutionRecord::new("second");
        storage.save(&second).unwrap();
        storage.save(&first).unwrap();

        let listed = storage.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].instruction, "first");
        assert_eq!(listed[1].instruction, "second");
    }

    #[test]
    fn list_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());
        storage.save(&ExecutionRecord::new("good")).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let listed = storage.list().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn step_screenshot_lands_under_record_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordStorage::new(dir.path());
        let record = ExecutionRecord::new("task");

        let path = storage
            .save_step_screenshot(record.id, 3, b"\xff\xd8fake jpeg")
            .unwrap();

        assert!(path.ends_with(format!("{}/step_3.jpg", record.id)));
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8fake jpeg");
    }

    #[test]
    fn list_on_missing_directory_is_empty() {
        let storage = RecordStorage::new("/nonexistent/pocketpilot-test");
        assert!(storage.list().unwrap().is_empty());
    }
}

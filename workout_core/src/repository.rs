//! Session persistence.
//!
//! Completed sets are appended to a JSONL file (`sessions.jsonl`) under an exclusive
//! file lock. The raw samples of each set go to `metrics/<session-id>.csv`, written
//! to a temp file and renamed into place so a crash never leaves a partial file.

use crate::types::{TelemetrySample, WorkoutSessionRecord};
use crate::{Error, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Where finished sets are stored. Calls are blocking; the engine runs them off
/// the coordinator and only logs failures.
pub trait SessionRepository: Send + Sync {
    fn save_session(&self, record: &WorkoutSessionRecord) -> Result<()>;
    fn save_metrics(&self, session_id: Uuid, samples: &[TelemetrySample]) -> Result<()>;
}

/// File-backed repository rooted at the data directory
pub struct FileRepository {
    sessions_path: PathBuf,
    metrics_dir: PathBuf,
}

impl FileRepository {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            sessions_path: data_dir.join("sessions.jsonl"),
            metrics_dir: data_dir.join("metrics"),
        }
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    pub fn metrics_path(&self, session_id: Uuid) -> PathBuf {
        self.metrics_dir.join(format!("{}.csv", session_id))
    }
}

impl SessionRepository for FileRepository {
    fn save_session(&self, record: &WorkoutSessionRecord) -> Result<()> {
        if let Some(parent) = self.sessions_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sessions_path)?;
        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        tracing::debug!("Appended session {} to {:?}", record.id, self.sessions_path);
        Ok(())
    }

    fn save_metrics(&self, session_id: Uuid, samples: &[TelemetrySample]) -> Result<()> {
        std::fs::create_dir_all(&self.metrics_dir)?;

        let temp = NamedTempFile::new_in(&self.metrics_dir)?;
        let mut writer = csv::Writer::from_writer(temp.as_file());
        for sample in samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        drop(writer);
        temp.as_file().sync_all()?;

        let path = self.metrics_path(session_id);
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        tracing::debug!("Wrote {} samples to {:?}", samples.len(), path);
        Ok(())
    }
}

/// Read all sessions from a JSONL file; unparseable lines are skipped
pub fn read_sessions(path: &Path) -> Result<Vec<WorkoutSessionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut sessions = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WorkoutSessionRecord>(&line) {
            Ok(session) => sessions.push(session),
            Err(e) => {
                tracing::warn!("Failed to parse session at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} sessions from {:?}", sessions.len(), path);
    Ok(sessions)
}

/// Read a sample CSV written by `save_metrics` (or by hand, for replay)
pub fn read_samples(path: &Path) -> Result<Vec<TelemetrySample>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut samples = Vec::new();
    for row in reader.deserialize() {
        samples.push(row?);
    }
    Ok(samples)
}

/// Repository kept in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryRepository {
    sessions: Mutex<Vec<WorkoutSessionRecord>>,
    metrics: Mutex<HashMap<Uuid, Vec<TelemetrySample>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<WorkoutSessionRecord> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn metrics(&self, session_id: Uuid) -> Option<Vec<TelemetrySample>> {
        self.metrics
            .lock()
            .ok()
            .and_then(|m| m.get(&session_id).cloned())
    }
}

impl SessionRepository for MemoryRepository {
    fn save_session(&self, record: &WorkoutSessionRecord) -> Result<()> {
        self.sessions
            .lock()
            .map_err(|_| Error::Other("session store lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }

    fn save_metrics(&self, session_id: Uuid, samples: &[TelemetrySample]) -> Result<()> {
        self.metrics
            .lock()
            .map_err(|_| Error::Other("metrics store lock poisoned".into()))?
            .insert(session_id, samples.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompletionReason, SetSummary, WorkoutMode};
    use chrono::Utc;

    fn record() -> WorkoutSessionRecord {
        WorkoutSessionRecord {
            id: Uuid::new_v4(),
            exercise_id: "row".into(),
            exercise_name: "Seated Row".into(),
            mode: WorkoutMode::OldSchool,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            weight_per_cable_kg: 20.0,
            reason: CompletionReason::TargetReached,
            summary: SetSummary {
                working_reps: 10,
                ..SetSummary::default()
            },
        }
    }

    #[test]
    fn test_append_and_read_sessions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(temp_dir.path());

        let first = record();
        repo.save_session(&first).unwrap();
        repo.save_session(&record()).unwrap();

        let sessions = read_sessions(repo.sessions_path()).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0], first);
    }

    #[test]
    fn test_read_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let sessions = read_sessions(&temp_dir.path().join("sessions.jsonl")).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(temp_dir.path());
        repo.save_session(&record()).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(repo.sessions_path())
            .unwrap();
        writeln!(file, "{{ not json").unwrap();
        drop(file);
        repo.save_session(&record()).unwrap();

        assert_eq!(read_sessions(repo.sessions_path()).unwrap().len(), 2);
    }

    #[test]
    fn test_metrics_csv_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(temp_dir.path());
        let id = Uuid::new_v4();
        let samples: Vec<_> = (0..5)
            .map(|i| TelemetrySample {
                timestamp_ms: i * 100,
                position_a: i as f32 * 10.0,
                position_b: i as f32 * 10.0,
                velocity_a: 100.0,
                velocity_b: 100.0,
                load_a: 20.0,
                load_b: 20.0,
            })
            .collect();

        repo.save_metrics(id, &samples).unwrap();
        let loaded = read_samples(&repo.metrics_path(id)).unwrap();
        assert_eq!(loaded, samples);

        // Only the final file is left behind
        let files = std::fs::read_dir(temp_dir.path().join("metrics"))
            .unwrap()
            .count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_memory_repository() {
        let repo = MemoryRepository::new();
        let r = record();
        repo.save_session(&r).unwrap();
        repo.save_metrics(r.id, &[TelemetrySample::default()]).unwrap();

        assert_eq!(repo.sessions().len(), 1);
        assert_eq!(repo.metrics(r.id).map(|m| m.len()), Some(1));
    }
}

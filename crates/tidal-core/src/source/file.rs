//! Bounded source over a newline-delimited JSON file.
//!
//! Every line is one message on partition 0; its offset is the zero-based
//! line number. Blank lines become payload-less messages, which the decoder
//! rejects like any other malformed record.

use super::{MemorySource, SourceMessage, StartPositions, StreamSource};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// A bounded JSON-lines file source.
pub struct FileSource {
    path: PathBuf,
    topic: String,
    inner: MemorySource,
}

impl FileSource {
    /// Load a JSON-lines file. The topic names the file's records in
    /// positions and checkpoints.
    pub async fn open(path: impl AsRef<Path>, topic: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = read_input(&path).await?;
        Ok(Self::from_content(path, topic.into(), &content))
    }

    /// Load a backfill input under a topic derived from its canonical path
    /// and content. Distinct inputs never share offsets in table watermarks,
    /// while rerunning the same unchanged file resumes from its checkpoint.
    pub async fn open_input(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = read_input(&path).await?;
        let canonical = tokio::fs::canonicalize(&path).await.map_err(|e| {
            Error::Config(format!("Failed to resolve input file {}: {}", path.display(), e))
        })?;
        let topic = input_topic(&canonical, &content);
        Ok(Self::from_content(path, topic, &content))
    }

    /// Topic the file's records are read under.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn from_content(path: PathBuf, topic: String, content: &str) -> Self {
        let inner = MemorySource::bounded(topic.clone());
        let handle = inner.handle();
        let mut lines = 0usize;
        for line in content.lines() {
            let payload = (!line.trim().is_empty()).then(|| line.as_bytes().to_vec());
            handle.publish_raw(0, None, payload, None);
            lines += 1;
        }

        info!(path = %path.display(), topic = %topic, lines = lines, "Loaded input file");
        Self { path, topic, inner }
    }
}

async fn read_input(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Config(format!("Failed to read input file {}: {}", path.display(), e))
    })
}

/// `<stem>-<16 hex digits>`, stable for one path and content.
fn input_topic(canonical: &Path, content: &str) -> String {
    let mut name = canonical.to_string_lossy().into_owned().into_bytes();
    name.push(0);
    name.extend_from_slice(content.as_bytes());
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, &name).simple().to_string();

    let stem = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    format!("{}-{}", stem, &id[..16])
}

#[async_trait]
impl StreamSource for FileSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn seek(&mut self, start: &StartPositions) -> Result<()> {
        self.inner.seek(start).await
    }

    async fn poll_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceMessage>> {
        self.inner.poll_batch(max, timeout).await
    }

    fn is_exhausted(&self) -> bool {
        self.inner.is_exhausted()
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_reads_lines_with_line_offsets() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{\"uuid\":\"a\"}}").unwrap();
        writeln!(file, "{{\"uuid\":\"b\"}}").unwrap();
        writeln!(file, "{{\"uuid\":\"c\"}}").unwrap();

        let mut source = FileSource::open(file.path(), "backfill").await.unwrap();
        source.seek(&StartPositions::Earliest).await.unwrap();

        let batch = source.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].position.offset, 2);
        assert_eq!(batch[0].position.topic, "backfill");
        assert!(source.is_exhausted());
    }

    #[tokio::test]
    async fn test_resume_mid_file() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..4 {
            writeln!(file, "{{\"n\":{}}}", i).unwrap();
        }

        let mut source = FileSource::open(file.path(), "backfill").await.unwrap();
        source
            .seek(&StartPositions::Offsets(BTreeMap::from([(0, 2)])))
            .await
            .unwrap();
        let batch = source.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload.as_deref(), Some(&b"{\"n\":2}"[..]));
    }

    #[tokio::test]
    async fn test_input_topic_per_path_and_content() {
        let dir = tempfile::TempDir::new().unwrap();
        for year in ["2024", "2025"] {
            std::fs::create_dir(dir.path().join(year)).unwrap();
            std::fs::write(dir.path().join(year).join("events.jsonl"), "{\"n\":0}\n").unwrap();
        }
        let older = dir.path().join("2024").join("events.jsonl");
        let newer = dir.path().join("2025").join("events.jsonl");

        let first = FileSource::open_input(&older).await.unwrap();
        let again = FileSource::open_input(&older).await.unwrap();
        let other = FileSource::open_input(&newer).await.unwrap();
        assert_eq!(first.topic(), again.topic());
        assert_ne!(first.topic(), other.topic());
        assert!(first.topic().starts_with("events-"));

        std::fs::write(&older, "{\"n\":0}\n{\"n\":1}\n").unwrap();
        let edited = FileSource::open_input(&older).await.unwrap();
        assert_ne!(first.topic(), edited.topic());
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let result = FileSource::open("/nonexistent/input.jsonl", "backfill").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::warn;

use crate::message::TopicPartition;
use crate::AppError::InvalidValue;
use crate::AppResult;

/// Line-oriented offset checkpoint, one per log directory.
///
/// Format: `version` on line 1, entry `count` on line 2, then one
/// `topic partition offset` line per entry. Writes go through a temp file
/// and an atomic rename so a crash never leaves a torn checkpoint.
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
    version: i8,
}

impl CheckpointFile {
    pub const VERSION: i8 = 0;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: Self::VERSION,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn write_checkpoints(
        &self,
        points: &HashMap<TopicPartition, i64>,
    ) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        buf_writer
            .write_all(format!("{}\n", points.len()).as_bytes())
            .await?;
        for (topic_partition, offset) in points {
            buf_writer
                .write_all(
                    format!(
                        "{} {} {}\n",
                        topic_partition.topic(),
                        topic_partition.partition(),
                        offset
                    )
                    .as_bytes(),
                )
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn read_checkpoints(&self) -> AppResult<HashMap<TopicPartition, i64>> {
        let open_file = OpenOptions::new().read(true).open(&self.path).await;
        let Ok(file) = open_file else {
            warn!(
                "checkpoint file {:?} not found, starting with no checkpoints",
                self.path
            );
            return Ok(HashMap::new());
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line.trim().parse::<i8>()?;
        if version != self.version {
            return Err(InvalidValue("checkpoint version", version.to_string()));
        }

        line.clear();
        reader.read_line(&mut line).await?;
        let expected = line.trim().parse::<usize>()?;

        let mut points = HashMap::with_capacity(expected);
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let mut parts = line.split_whitespace();
            let (Some(topic), Some(partition), Some(offset), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(InvalidValue("checkpoint entry", line.clone()));
            };
            points.insert(
                TopicPartition::new(topic, partition.parse::<i32>()?),
                offset.parse::<i64>()?,
            );
            line.clear();
        }
        if points.len() != expected {
            return Err(InvalidValue("checkpoint count", points.len().to_string()));
        }
        Ok(points)
    }

    pub async fn remove(&self) -> AppResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_write_and_read_checkpoints() -> AppResult<()> {
        let dir = tempdir()?;
        let checkpoint = CheckpointFile::new(dir.path().join("replication-offset-checkpoint"));

        let mut points = HashMap::new();
        points.insert(TopicPartition::new("topic1", 0), 100);
        points.insert(TopicPartition::new("topic2", 1), 200);

        checkpoint.write_checkpoints(&points).await?;
        let read_points = checkpoint.read_checkpoints().await?;
        assert_eq!(points, read_points);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() -> AppResult<()> {
        let dir = tempdir()?;
        let checkpoint = CheckpointFile::new(dir.path().join("does-not-exist"));
        assert!(checkpoint.read_checkpoints().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_count_mismatch_is_rejected() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("replication-offset-checkpoint");
        fs::write(&path, "0\n2\ntopic1 0 100\n").await?;
        let checkpoint = CheckpointFile::new(path);
        assert!(checkpoint.read_checkpoints().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_version_is_rejected() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("replication-offset-checkpoint");
        fs::write(&path, "9\n0\n").await?;
        let checkpoint = CheckpointFile::new(path);
        assert!(checkpoint.read_checkpoints().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_replaces_contents() -> AppResult<()> {
        let dir = tempdir()?;
        let checkpoint = CheckpointFile::new(dir.path().join("replication-offset-checkpoint"));

        let mut points = HashMap::new();
        points.insert(TopicPartition::new("topic1", 0), 100);
        checkpoint.write_checkpoints(&points).await?;

        points.insert(TopicPartition::new("topic1", 0), 150);
        checkpoint.write_checkpoints(&points).await?;

        let read_points = checkpoint.read_checkpoints().await?;
        assert_eq!(read_points.len(), 1);
        assert_eq!(read_points[&TopicPartition::new("topic1", 0)], 150);
        Ok(())
    }
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local recovery journal for in-flight uploads.
//!
//! The journal is a local append-only mirror of every byte handed to an
//! upload, keyed by the remote session identifier, plus a small JSON
//! manifest. It is not a wire format: its only purpose is to let a process
//! resume an interrupted upload by re-reading unacknowledged bytes from disk
//! instead of from the original, possibly already-closed, source.

use crate::content::RewindableContent;
use crate::{Error, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Manifest {
    session_id: String,
    data_file: String,
}

/// An append-only mirror of the bytes handed to one upload session.
#[derive(Debug)]
pub struct RecoveryLog {
    session_id: String,
    manifest_path: PathBuf,
    data_path: PathBuf,
    file: tokio::fs::File,
    len: u64,
}

impl RecoveryLog {
    /// Creates a journal for a new session under `dir`.
    pub async fn create<P: AsRef<Path>, S: Into<String>>(dir: P, session_id: S) -> Result<Self> {
        let session_id = session_id.into();
        let stem = self::file_stem(&session_id);
        let manifest_path = dir.as_ref().join(format!("{stem}.json"));
        let data_path = dir.as_ref().join(format!("{stem}.bin"));
        let manifest = Manifest {
            session_id: session_id.clone(),
            data_file: format!("{stem}.bin"),
        };
        let contents = serde_json::to_vec(&manifest).map_err(Error::ser)?;
        tokio::fs::write(&manifest_path, contents)
            .await
            .map_err(Error::io)?;
        let file = tokio::fs::File::create(&data_path).await.map_err(Error::io)?;
        Ok(Self {
            session_id,
            manifest_path,
            data_path,
            file,
            len: 0,
        })
    }

    /// Reopens the journal of an interrupted session under `dir`.
    pub async fn open<P: AsRef<Path>, S: Into<String>>(dir: P, session_id: S) -> Result<Self> {
        let session_id = session_id.into();
        let stem = self::file_stem(&session_id);
        let manifest_path = dir.as_ref().join(format!("{stem}.json"));
        let contents = tokio::fs::read(&manifest_path).await.map_err(Error::io)?;
        let manifest: Manifest = serde_json::from_slice(&contents).map_err(Error::deser)?;
        if manifest.session_id != session_id {
            return Err(Error::deser(format!(
                "recovery manifest is for session {}, not {session_id}",
                manifest.session_id
            )));
        }
        let data_path = dir.as_ref().join(&manifest.data_file);
        let len = tokio::fs::metadata(&data_path).await.map_err(Error::io)?.len();
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&data_path)
            .await
            .map_err(Error::io)?;
        Ok(Self {
            session_id,
            manifest_path,
            data_path,
            file,
            len,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The number of bytes mirrored so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data` to the mirror.
    pub async fn append(&mut self, data: &Bytes) -> Result<()> {
        self.file.write_all(data).await.map_err(Error::io)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Flushes the mirror to disk.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await.map_err(Error::io)?;
        self.file.sync_data().await.map_err(Error::io)
    }

    /// The mirrored bytes as rewindable upload content.
    pub async fn content(&mut self) -> Result<RewindableContent> {
        self.sync().await?;
        RewindableContent::from_path(self.data_path.clone()).await
    }

    /// Deletes the journal, typically after the session finalizes.
    pub async fn remove(self) -> Result<()> {
        drop(self.file);
        tokio::fs::remove_file(&self.data_path)
            .await
            .map_err(Error::io)?;
        tokio::fs::remove_file(&self.manifest_path)
            .await
            .map_err(Error::io)
    }
}

// Session ids can contain characters that are not valid in file names.
fn file_stem(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn mirror_and_reopen() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut log = RecoveryLog::create(dir.path(), "session/123").await?;
        assert_eq!(log.session_id(), "session/123");
        assert!(log.is_empty());

        log.append(&Bytes::from_static(b"hello ")).await?;
        log.append(&Bytes::from_static(b"world")).await?;
        log.sync().await?;
        assert_eq!(log.len(), 11);
        drop(log);

        let mut reopened = RecoveryLog::open(dir.path(), "session/123").await?;
        assert_eq!(reopened.len(), 11);
        let mut content = reopened.content().await?;
        assert_eq!(content.total_len(), 11);
        let got = content.next(usize::MAX).await?.expect("some bytes");
        assert_eq!(&got[..], b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn reopen_appends() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut log = RecoveryLog::create(dir.path(), "s1").await?;
        log.append(&Bytes::from_static(b"abc")).await?;
        log.sync().await?;
        drop(log);

        let mut log = RecoveryLog::open(dir.path(), "s1").await?;
        log.append(&Bytes::from_static(b"def")).await?;
        let mut content = log.content().await?;
        let got = content.next(usize::MAX).await?.expect("some bytes");
        assert_eq!(&got[..], b"abcdef");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_session() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log = RecoveryLog::create(dir.path(), "s1").await?;
        drop(log);
        // The file stems collide only if the ids collide after mangling.
        let err = RecoveryLog::open(dir.path(), "s2").await.unwrap_err();
        assert!(err.is_io(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn remove_cleans_up() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut log = RecoveryLog::create(dir.path(), "s1").await?;
        log.append(&Bytes::from_static(b"abc")).await?;
        log.remove().await?;
        let entries = std::fs::read_dir(dir.path())?.count();
        assert_eq!(entries, 0);
        Ok(())
    }
}

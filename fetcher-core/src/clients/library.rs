//! Library CLI façade (spec §6 "External CLIs", `metadata_preservation_mode`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MetadataPreservationMode;
use crate::error::{FetcherError, Result};

/// Operations against the external library CLI.
///
/// Each method maps to one subcommand invocation; [`LibraryClient::integrate`]
/// sequences them per `metadata_preservation_mode` and is the only entry
/// point [`crate::worker::SiteWorker`] calls directly.
#[async_trait]
pub trait LibraryClient: Send + Sync {
    /// Look up an existing book by story URL. `None` if not found.
    async fn lookup_by_url(&self, url: &str) -> Result<Option<String>>;

    /// Add a new EPUB, returning its newly assigned library id.
    async fn add(&self, epub_path: &Path) -> Result<String>;

    /// Replace the stored file for `library_id` in place, preserving all
    /// metadata (`add_format` mode).
    async fn replace_format(&self, library_id: &str, epub_path: &Path) -> Result<()>;

    /// Remove an existing entry (`remove_add` / `preserve_metadata` modes).
    async fn remove(&self, library_id: &str) -> Result<()>;

    /// Dump custom fields for `library_id` (`preserve_metadata` mode).
    async fn export_custom_fields(&self, library_id: &str) -> Result<HashMap<String, String>>;

    /// Reload previously exported custom fields onto `library_id`.
    async fn restore_custom_fields(
        &self,
        library_id: &str,
        fields: HashMap<String, String>,
    ) -> Result<()>;

    /// Integrate `epub_path` into the library for a story with (possibly
    /// absent) `existing_library_id`, following `mode`. Returns the final
    /// library id (new id if added, unchanged id if replaced/restored).
    async fn integrate(
        &self,
        existing_library_id: Option<&str>,
        epub_path: &Path,
        mode: MetadataPreservationMode,
    ) -> Result<String> {
        let Some(library_id) = existing_library_id else {
            return self.add(epub_path).await;
        };

        match mode {
            MetadataPreservationMode::AddFormat => {
                self.replace_format(library_id, epub_path).await?;
                Ok(library_id.to_string())
            }
            MetadataPreservationMode::RemoveAdd => {
                self.remove(library_id).await?;
                self.add(epub_path).await
            }
            MetadataPreservationMode::PreserveMetadata => {
                let fields = self.export_custom_fields(library_id).await?;
                self.remove(library_id).await?;
                let new_id = self.add(epub_path).await?;
                self.restore_custom_fields(&new_id, fields).await?;
                Ok(new_id)
            }
        }
    }
}

/// Real [`LibraryClient`] backed by a subprocess CLI, invoked the same way
/// as [`crate::clients::fetcher_client::ProcessFetcherClient`].
#[derive(Debug, Clone)]
pub struct ProcessLibraryClient {
    binary_path: String,
    library_path: String,
}

impl ProcessLibraryClient {
    pub fn new(binary_path: impl Into<String>, library_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            library_path: library_path.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg(&self.library_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(args = ?args, "invoking library CLI");
        let output = cmd
            .output()
            .await
            .map_err(|e| FetcherError::Library(format!("spawn failed: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetcherError::Library(format!(
                "library CLI exited with {:?}: {stderr}",
                output.status.code()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl LibraryClient for ProcessLibraryClient {
    async fn lookup_by_url(&self, url: &str) -> Result<Option<String>> {
        let out = self.run(&["search", url]).await?;
        Ok(out.lines().next().map(str::trim).filter(|s| !s.is_empty()).map(String::from))
    }

    async fn add(&self, epub_path: &Path) -> Result<String> {
        let path_str = epub_path.to_string_lossy();
        let out = self.run(&["add", &path_str]).await?;
        let marker = "Added book ids:";
        let id = out
            .lines()
            .find_map(|line| line.trim().strip_prefix(marker))
            .map(str::trim)
            .ok_or_else(|| {
                FetcherError::Library(format!("could not parse added id from: {out}"))
            })?;
        info!(library_id = id, "added book to library");
        Ok(id.to_string())
    }

    async fn replace_format(&self, library_id: &str, epub_path: &Path) -> Result<()> {
        let path_str = epub_path.to_string_lossy();
        self.run(&["add_format", "--dont-replace", library_id, &path_str])
            .await?;
        Ok(())
    }

    async fn remove(&self, library_id: &str) -> Result<()> {
        self.run(&["remove", library_id]).await?;
        Ok(())
    }

    async fn export_custom_fields(&self, library_id: &str) -> Result<HashMap<String, String>> {
        let out = self.run(&["export_fields", library_id]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    async fn restore_custom_fields(
        &self,
        library_id: &str,
        fields: HashMap<String, String>,
    ) -> Result<()> {
        for (key, value) in fields {
            self.run(&["set_field", &key, library_id, &value]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LibraryClient for RecordingClient {
        async fn lookup_by_url(&self, _url: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn add(&self, _epub_path: &Path) -> Result<String> {
            self.calls.lock().unwrap().push("add".into());
            Ok("99".into())
        }
        async fn replace_format(&self, _library_id: &str, _epub_path: &Path) -> Result<()> {
            self.calls.lock().unwrap().push("replace_format".into());
            Ok(())
        }
        async fn remove(&self, _library_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("remove".into());
            Ok(())
        }
        async fn export_custom_fields(&self, _library_id: &str) -> Result<HashMap<String, String>> {
            self.calls.lock().unwrap().push("export".into());
            Ok(HashMap::from([("tag".to_string(), "v".to_string())]))
        }
        async fn restore_custom_fields(
            &self,
            _library_id: &str,
            _fields: HashMap<String, String>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push("restore".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn remove_add_mode_sequences_remove_then_add() {
        let client = RecordingClient::default();
        client
            .integrate(Some("1"), Path::new("/tmp/x.epub"), MetadataPreservationMode::RemoveAdd)
            .await
            .unwrap();
        assert_eq!(*client.calls.lock().unwrap(), vec!["remove", "add"]);
    }

    #[tokio::test]
    async fn preserve_metadata_mode_sequences_export_remove_add_restore() {
        let client = RecordingClient::default();
        client
            .integrate(
                Some("1"),
                Path::new("/tmp/x.epub"),
                MetadataPreservationMode::PreserveMetadata,
            )
            .await
            .unwrap();
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec!["export", "remove", "add", "restore"]
        );
    }

    #[tokio::test]
    async fn add_format_mode_replaces_in_place() {
        let client = RecordingClient::default();
        let id = client
            .integrate(Some("7"), Path::new("/tmp/x.epub"), MetadataPreservationMode::AddFormat)
            .await
            .unwrap();
        assert_eq!(*client.calls.lock().unwrap(), vec!["replace_format"]);
        assert_eq!(id, "7");
    }

    #[tokio::test]
    async fn new_book_always_uses_plain_add_regardless_of_mode() {
        let client = RecordingClient::default();
        client
            .integrate(None, Path::new("/tmp/x.epub"), MetadataPreservationMode::PreserveMetadata)
            .await
            .unwrap();
        assert_eq!(*client.calls.lock().unwrap(), vec!["add"]);
    }
}

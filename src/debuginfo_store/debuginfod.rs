use super::{BinaryDescriptor, FileLocator, Lookup};
use crate::trace::SymbolFileDescriptor;
use anyhow::{bail, Context};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_SERVER: &str = "https://debuginfod.elfutils.org/";

/// DebuginfodLocator downloads binaries and debug files by build id from
/// debuginfod servers and keeps them in a local cache directory.
#[derive(Debug, Clone)]
pub struct DebuginfodLocator {
    upstream_servers: Vec<Url>,
    cache_dir: PathBuf,
    client: ureq::Agent,
}

#[derive(Debug, Clone, Copy)]
enum ArtifactKind {
    Executable,
    Debuginfo,
}

impl ArtifactKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Executable => "executable",
            Self::Debuginfo => "debuginfo",
        }
    }
}

impl DebuginfodLocator {
    pub fn new(servers: &[String], cache_dir: PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        let mut upstream_servers = Vec::with_capacity(servers.len());
        for server in servers {
            // Url::join drops the last path segment unless it ends in a slash.
            let server = if server.ends_with('/') {
                server.clone()
            } else {
                format!("{}/", server)
            };
            let url = Url::parse(&server)
                .with_context(|| format!("Invalid debuginfod server url {}", server))?;
            upstream_servers.push(url);
        }

        Ok(Self {
            upstream_servers,
            cache_dir,
            client: ureq::AgentBuilder::new()
                .timeout_read(timeout)
                .timeout_write(timeout)
                .redirects(2)
                .build(),
        })
    }

    /// Locator for the public elfutils server, caching into the system temp directory.
    pub fn with_default_server(timeout: Duration) -> anyhow::Result<Self> {
        Self::new(
            &[DEFAULT_SERVER.to_string()],
            std::env::temp_dir().join("evresolver-debuginfod"),
            timeout,
        )
    }

    fn cache_path(&self, build_id: &str, kind: ArtifactKind) -> PathBuf {
        self.cache_dir.join(build_id).join(kind.as_str())
    }

    async fn fetch(&self, build_id: Option<&str>, kind: ArtifactKind) -> Lookup<PathBuf> {
        let build_id = match build_id {
            Some(id) if is_valid_build_id(id) => id.to_lowercase(),
            _ => return Lookup::NotFound,
        };

        let target = self.cache_path(&build_id, kind);
        if target.is_file() {
            log::debug!("debuginfod cache hit for {}", target.display());
            return Lookup::Found(target);
        }
        if self.upstream_servers.is_empty() {
            return Lookup::NotFound;
        }

        let this = self.clone();
        let result =
            tokio::task::spawn_blocking(move || this.download(&build_id, kind, &target)).await;
        match result {
            Ok(lookup) => lookup,
            Err(e) => Lookup::Error(e.into()),
        }
    }

    fn download(&self, build_id: &str, kind: ArtifactKind, target: &Path) -> Lookup<PathBuf> {
        let mut last_error = None;

        for server in self.upstream_servers.iter() {
            let url = match server.join(&format!("buildid/{}/{}", build_id, kind.as_str())) {
                Ok(url) => url,
                Err(e) => {
                    last_error = Some(anyhow::Error::from(e));
                    continue;
                }
            };

            let response = match self.client.get(url.as_str()).call() {
                Ok(response) => response,
                Err(ureq::Error::Status(404, _)) => continue,
                Err(err) => {
                    log::debug!("Failed to fetch {}: {}", url, err);
                    last_error = Some(anyhow::anyhow!("Failed to fetch {}: {}", url, err));
                    continue;
                }
            };

            return match self.store(response, target) {
                Ok(()) => Lookup::Found(target.to_path_buf()),
                Err(e) => Lookup::Error(e),
            };
        }

        match last_error {
            Some(e) => Lookup::Error(e),
            None => Lookup::NotFound,
        }
    }

    fn store(&self, response: ureq::Response, target: &Path) -> anyhow::Result<()> {
        let dir = match target.parent() {
            Some(dir) => dir,
            None => bail!("Cache path {} has no parent", target.display()),
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        let mut content = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut content)
            .context("Failed to read debuginfod response")?;

        let mut tmp_file =
            tempfile::NamedTempFile::new_in(dir).context("Failed to create temporary file")?;
        tmp_file
            .write_all(&content)
            .context("Failed to write to temporary file")?;
        tmp_file.flush().context("Failed to flush temporary file")?;
        tmp_file
            .persist(target)
            .with_context(|| format!("Failed to persist {}", target.display()))?;
        Ok(())
    }
}

fn is_valid_build_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
}

impl FileLocator for DebuginfodLocator {
    async fn locate_binary(&self, binary: &BinaryDescriptor) -> Lookup<PathBuf> {
        self.fetch(binary.build_id.as_deref(), ArtifactKind::Executable)
            .await
    }

    async fn locate_symbols(&self, symbols: &SymbolFileDescriptor) -> Lookup<PathBuf> {
        self.fetch(symbols.build_id.as_deref(), ArtifactKind::Debuginfo)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(build_id: Option<&str>) -> SymbolFileDescriptor {
        SymbolFileDescriptor {
            file_name: "libc.so.6".to_string(),
            build_id: build_id.map(str::to_string),
            age: 0,
        }
    }

    #[test]
    fn test_build_id_validation() {
        assert!(is_valid_build_id("252f7dc22ca9d935e8334f04a0232f35359b5880"));
        assert!(!is_valid_build_id("../../etc/passwd"));
        assert!(!is_valid_build_id(""));
    }

    #[tokio::test]
    async fn test_cached_file_is_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let id = "252f7dc22ca9d935e8334f04a0232f35359b5880";
        let cached = dir.path().join(id).join("debuginfo");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"\x7fELF").unwrap();

        // Port 9 is discard; nothing should ever connect to it.
        let locator = DebuginfodLocator::new(
            &["http://127.0.0.1:9".to_string()],
            dir.path().to_path_buf(),
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(locator.locate_symbols(&symbols(Some(id))).await.found(), Some(cached));
    }

    #[tokio::test]
    async fn test_without_build_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locator =
            DebuginfodLocator::new(&[], dir.path().to_path_buf(), Duration::from_secs(1)).unwrap();

        assert!(matches!(locator.locate_symbols(&symbols(None)).await, Lookup::NotFound));
        assert!(matches!(
            locator.locate_symbols(&symbols(Some("abcd"))).await,
            Lookup::NotFound
        ));
    }

    #[test]
    fn test_server_url_gets_trailing_slash() {
        let locator = DebuginfodLocator::new(
            &["https://debuginfod.example.com/api".to_string()],
            PathBuf::from("/tmp"),
            Duration::from_secs(1),
        )
        .unwrap();
        let url = locator.upstream_servers[0]
            .join("buildid/ab/debuginfo")
            .unwrap();
        assert_eq!(url.as_str(), "https://debuginfod.example.com/api/buildid/ab/debuginfo");
    }
}

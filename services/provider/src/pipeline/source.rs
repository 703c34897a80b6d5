//! Space sources: descriptor lookup, file download and deploy-mode detection.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Model settings files selecting model-inference deployment.
pub const MODEL_SETTING_FILES: [&str; 2] = ["model-setting.json", "models-setting.json"];

const DEFAULT_MANIFEST: &str = "deploy.yaml";
const DOCKERFILE: &str = "Dockerfile";

/// Space descriptor served at a job's source URI.
#[derive(Debug, Clone, Deserialize)]
pub struct SpaceDescriptor {
    pub data: SpaceData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceData {
    #[serde(default)]
    pub files: Vec<SpaceFile>,
    pub owner: SpaceOwner,
    pub space: SpaceInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceFile {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceOwner {
    pub public_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceInfo {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "activeOrder")]
    pub active_order: ActiveOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveOrder {
    pub config: HardwareConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub description: String,
}

impl SpaceDescriptor {
    pub fn wallet_address(&self) -> &str {
        &self.data.owner.public_address
    }

    pub fn space_name(&self) -> &str {
        &self.data.space.name
    }

    pub fn space_uuid(&self) -> String {
        self.data.space.uuid.to_lowercase()
    }

    pub fn hardware_description(&self) -> &str {
        &self.data.space.active_order.config.description
    }
}

/// How a downloaded space gets deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployMode {
    ModelInference { settings: PathBuf },
    Manifest { path: PathBuf },
    Dockerfile { path: PathBuf },
}

/// Pick the deploy mode from the downloaded files.
///
/// Model settings win over a manifest, a manifest wins over a Dockerfile.
pub fn detect_mode(root: &Path, files: &[String]) -> Option<DeployMode> {
    let named = |wanted: &str| {
        files
            .iter()
            .find(|f| file_name(f).eq_ignore_ascii_case(wanted))
            .map(|f| root.join(f))
    };

    if let Some(settings) = MODEL_SETTING_FILES.iter().find_map(|name| named(name)) {
        return Some(DeployMode::ModelInference { settings });
    }
    if let Some(path) = named(DEFAULT_MANIFEST).or_else(|| {
        files
            .iter()
            .find(|f| f.ends_with(".yaml") || f.ends_with(".yml"))
            .map(|f| root.join(f))
    }) {
        return Some(DeployMode::Manifest { path });
    }
    named(DOCKERFILE).map(|path| DeployMode::Dockerfile { path })
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Reject names that would escape the space directory.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let path = PathBuf::from(name.trim_start_matches('/'));
    if path.as_os_str().is_empty() || path.components().any(|c| !matches!(c, Component::Normal(_))) {
        anyhow::bail!("refusing to write space file '{name}'");
    }
    Ok(path)
}

/// Build directory of a space: `<data_dir>/build/<wallet>/spaces/<space_name>`.
pub fn space_dir(data_dir: &Path, wallet_address: &str, space_name: &str) -> Result<PathBuf> {
    Ok(data_dir
        .join("build")
        .join(safe_relative(wallet_address)?)
        .join("spaces")
        .join(safe_relative(space_name)?))
}

/// Fetches descriptors and files over HTTP.
#[derive(Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub async fn descriptor(&self, job_source_uri: &str) -> Result<SpaceDescriptor> {
        let response = self
            .client
            .get(job_source_uri)
            .send()
            .await
            .context("error making request to space API")?;
        if !response.status().is_success() {
            anyhow::bail!("space API response not OK: {}", response.status());
        }
        response
            .json()
            .await
            .context("error decoding space API response")
    }

    /// Previous public URL of a running space, as `{job_result_uri}`.
    pub async fn result_host(&self, job_result_uri: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct HostInfo {
            job_result_uri: String,
        }

        let response = self.client.get(job_result_uri).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("space result response not OK: {}", response.status());
        }
        let info: HostInfo = response.json().await?;
        Ok(info
            .job_result_uri
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string())
    }

    /// Download every file of the space into `dir`, replacing what was there.
    /// Returns the relative names written.
    pub async fn download(&self, descriptor: &SpaceDescriptor, dir: &Path) -> Result<Vec<String>> {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("clearing {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut written = Vec::with_capacity(descriptor.data.files.len());
        for file in &descriptor.data.files {
            let relative = safe_relative(&file.name)?;
            let target = dir.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let response = self
                .client
                .get(&file.url)
                .send()
                .await
                .with_context(|| format!("downloading {}", file.name))?;
            if !response.status().is_success() {
                anyhow::bail!("downloading {} failed: {}", file.name, response.status());
            }
            let bytes = response.bytes().await?;
            tokio::fs::write(&target, &bytes).await?;
            debug!(file = %file.name, bytes = bytes.len(), "Space file downloaded");
            written.push(relative.to_string_lossy().replace('\\', "/"));
        }

        info!(space = %descriptor.space_name(), files = written.len(), dir = %dir.display(), "Space source downloaded");
        Ok(written)
    }
}

/// Containers listed in a space manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpaceManifest {
    #[serde(default)]
    pub containers: Vec<ManifestContainer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestContainer {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl SpaceManifest {
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(content).context("invalid space manifest")?;
        if manifest.containers.is_empty() {
            anyhow::bail!("space manifest lists no containers");
        }
        Ok(manifest)
    }
}

/// Port from the first `EXPOSE` line of a Dockerfile.
pub fn exposed_port(dockerfile: &str) -> Option<u16> {
    dockerfile.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match words.next() {
            Some(w) if w.eq_ignore_ascii_case("EXPOSE") => words.next()?.split('/').next()?.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mode_precedence() {
        let root = Path::new("/spaces/demo");
        assert!(matches!(
            detect_mode(root, &names(&["Dockerfile", "deploy.yaml", "model-setting.json"])),
            Some(DeployMode::ModelInference { .. })
        ));
        assert_eq!(
            detect_mode(root, &names(&["Dockerfile", "app/deploy.yaml"])),
            Some(DeployMode::Manifest {
                path: root.join("app/deploy.yaml")
            })
        );
        assert!(matches!(
            detect_mode(root, &names(&["Dockerfile", "app.py"])),
            Some(DeployMode::Dockerfile { .. })
        ));
        assert_eq!(detect_mode(root, &names(&["README.md"])), None);
    }

    #[test]
    fn test_unsafe_names_rejected() {
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("").is_err());
        assert_eq!(safe_relative("/app/main.py").unwrap(), PathBuf::from("app/main.py"));
        assert!(space_dir(Path::new("/data"), "0xabc", "..").is_err());
        assert_eq!(
            space_dir(Path::new("/data"), "0xabc", "demo").unwrap(),
            PathBuf::from("/data/build/0xabc/spaces/demo")
        );
    }

    #[test]
    fn test_manifest_and_expose() {
        let manifest = SpaceManifest::parse(
            "containers:\n  - name: web\n    image: nginx:1.25\n    ports: [80]\n    env:\n      MODE: prod\n",
        )
        .unwrap();
        assert_eq!(manifest.containers[0].ports, vec![80]);
        assert_eq!(manifest.containers[0].env.get("MODE").map(String::as_str), Some("prod"));
        assert!(SpaceManifest::parse("containers: []").is_err());

        assert_eq!(exposed_port("FROM python:3.11\nEXPOSE 8080/tcp\n"), Some(8080));
        assert_eq!(exposed_port("FROM scratch\n"), None);
    }

    #[tokio::test]
    async fn test_descriptor_and_download() {
        let server = MockServer::start().await;
        let descriptor = serde_json::json!({
            "data": {
                "files": [
                    { "name": "Dockerfile", "url": format!("{}/files/dockerfile", server.uri()) },
                    { "name": "app/main.py", "url": format!("{}/files/main", server.uri()) }
                ],
                "owner": { "public_address": "0xABC" },
                "space": {
                    "uuid": "UUID-1",
                    "name": "demo",
                    "activeOrder": { "config": { "description": "CPU only · 2 vCPU · 4 GiB" } }
                }
            }
        });
        Mock::given(method("GET"))
            .and(path("/spaces/UUID-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(descriptor))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/dockerfile"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FROM python:3.11\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/main"))
            .respond_with(ResponseTemplate::new(200).set_body_string("print('hi')\n"))
            .mount(&server)
            .await;

        let fetcher = SourceFetcher::new().unwrap();
        let descriptor = fetcher
            .descriptor(&format!("{}/spaces/UUID-1", server.uri()))
            .await
            .unwrap();
        assert_eq!(descriptor.space_uuid(), "uuid-1");
        assert_eq!(descriptor.hardware_description(), "CPU only · 2 vCPU · 4 GiB");

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("spaces/demo");
        let files = fetcher.download(&descriptor, &target).await.unwrap();
        assert_eq!(files, vec!["Dockerfile".to_string(), "app/main.py".to_string()]);
        assert!(target.join("app/main.py").exists());
    }
}

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cp_placement::{parse_cpu, parse_quantity, Node, QuantityError, Resources};
use serde::Deserialize;

use crate::api::API_PREFIX;

const DEFAULT_INFERENCE_IMAGE: &str = "lagrange/hf-inference:v1.0";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Repo directory holding `fil-c2.env`, the node id and the keystore.
    pub cp_path: PathBuf,
    pub node_id: String,
    /// `/ip4/<ip>/tcp/<port>` under which the hub reaches this provider.
    pub multi_address: String,
    pub domain: String,
    pub engine_address: String,
    pub hub_address: String,
    pub verify_sign: bool,
    pub ubi_task: bool,
    pub reward_url: Option<String>,
    pub chain_gateway_url: String,
    pub status_hub_url: Option<String>,
    pub data_dir: PathBuf,
    /// Record store file. Records live in memory when unset.
    pub db_path: Option<PathBuf>,
    pub inference_image: String,
    pub keystore_dir: PathBuf,
    /// YAML node inventory backing the cluster.
    pub nodes_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("CP_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8085".to_string())
            .parse()
            .context("CP_LISTEN_ADDR")?;

        let log_level = var("CP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let cp_path = var("CP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".swan/computing"));

        let node_id = match non_empty(var("CP_NODE_ID")) {
            Some(id) => id,
            None => {
                let path = cp_path.join("node_id");
                let id = std::fs::read_to_string(&path)
                    .with_context(|| format!("CP_NODE_ID unset and {} unreadable", path.display()))?;
                id.trim().to_string()
            }
        };
        if node_id.is_empty() {
            bail!("node id is empty");
        }

        let multi_address = var("CP_MULTI_ADDRESS").unwrap_or_else(|| "/ip4/127.0.0.1/tcp/8085".to_string());
        parse_multi_address(&multi_address)?;

        let flag = |name: &str, default: bool| {
            var(name)
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(default)
        };

        let data_dir = var("CP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cp_path.join("data"));
        let keystore_dir = var("CP_KEYSTORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cp_path.join("keystore"));

        Ok(Self {
            listen_addr,
            log_level,
            node_id,
            multi_address,
            domain: var("CP_DOMAIN").unwrap_or_default(),
            engine_address: var("CP_UBI_ENGINE_ADDRESS").unwrap_or_default(),
            hub_address: var("CP_HUB_ADDRESS").unwrap_or_default(),
            verify_sign: flag("CP_VERIFY_SIGN", true),
            ubi_task: flag("CP_UBI_TASK", false),
            reward_url: non_empty(var("CP_REWARD_URL")),
            chain_gateway_url: var("CP_CHAIN_GATEWAY_URL").unwrap_or_else(|| "http://127.0.0.1:8546".to_string()),
            status_hub_url: non_empty(var("CP_STATUS_HUB_URL")),
            db_path: non_empty(var("CP_DB_PATH")).map(PathBuf::from),
            inference_image: var("CP_INFERENCE_IMAGE").unwrap_or_else(|| DEFAULT_INFERENCE_IMAGE.to_string()),
            nodes_file: non_empty(var("CP_NODES")).map(PathBuf::from),
            cp_path,
            data_dir,
            keystore_dir,
        })
    }

    /// URL proof workers post their result to.
    pub fn callback_url(&self) -> String {
        match parse_multi_address(&self.multi_address) {
            Ok((ip, port)) => format!("http://{ip}:{port}{API_PREFIX}/cp/docker/receive/ubi"),
            Err(_) => format!("http://{}{API_PREFIX}/cp/docker/receive/ubi", self.listen_addr),
        }
    }

    /// Nodes from the inventory file, empty when none is configured.
    pub fn load_nodes(&self) -> Result<Vec<Node>> {
        match &self.nodes_file {
            Some(path) => read_node_inventory(path),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InventoryFile {
    Wrapped { nodes: Vec<NodeEntry> },
    List(Vec<NodeEntry>),
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    cpu: Amount,
    memory: Amount,
    storage: Amount,
    #[serde(default)]
    accelerators: BTreeMap<String, i64>,
}

/// `16`, `"16"` and `"64 GiB"` are all accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Amount {
    Number(f64),
    Text(String),
}

impl Amount {
    fn text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl NodeEntry {
    fn into_node(self) -> Result<Node> {
        let field = |what: &str, amount: &Amount, parse: fn(&str) -> Result<i64, QuantityError>| {
            parse(&amount.text()).with_context(|| format!("node {}: invalid {what}", self.name))
        };
        let capacity = Resources::new(
            field("cpu", &self.cpu, parse_cpu)?,
            field("memory", &self.memory, parse_quantity)?,
            field("storage", &self.storage, parse_quantity)?,
        );
        let mut node = Node::new(self.name.trim(), capacity);
        node.labels = self.labels;
        node.accelerators = self.accelerators;
        Ok(node)
    }
}

/// Read a node inventory: either a bare list or a `nodes:` mapping.
pub fn read_node_inventory(path: &Path) -> Result<Vec<Node>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read node inventory {}", path.display()))?;
    let inventory: InventoryFile =
        serde_yaml::from_str(&raw).with_context(|| format!("parse node inventory {}", path.display()))?;
    let entries = match inventory {
        InventoryFile::Wrapped { nodes } | InventoryFile::List(nodes) => nodes,
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.name.trim().is_empty() {
            bail!("node inventory {}: node without a name", path.display());
        }
        if nodes.iter().any(|n: &Node| n.name == entry.name.trim()) {
            bail!("node inventory {}: duplicate node {}", path.display(), entry.name.trim());
        }
        nodes.push(entry.into_node()?);
    }
    Ok(nodes)
}

/// Split `/ip4/<ip>/tcp/<port>` into its host and port.
pub fn parse_multi_address(addr: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = addr.trim().split('/').collect();
    match parts.as_slice() {
        ["", "ip4" | "ip6" | "dns" | "dns4", host, "tcp", port, ..] if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in multi-address {addr}"))?;
            Ok((host.to_string(), port))
        }
        _ => bail!("invalid multi-address {addr}, expected /ip4/<ip>/tcp/<port>"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use cp_placement::GIB;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("CP_NODE_ID", "node-1")])).unwrap();
        assert_eq!(config.listen_addr.port(), 8085);
        assert!(config.verify_sign);
        assert!(!config.ubi_task);
        assert_eq!(config.data_dir, PathBuf::from(".swan/computing/data"));
        assert!(config.db_path.is_none());
        assert_eq!(
            config.callback_url(),
            "http://127.0.0.1:8085/api/v1/computing/cp/docker/receive/ubi"
        );
    }

    #[test]
    fn test_node_id_read_from_repo() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("node_id"), "04abcdef\n").unwrap();
        let path = repo.path().display().to_string();

        let config = Config::from_lookup(lookup(&[("CP_PATH", &path), ("CP_UBI_TASK", "1")])).unwrap();
        assert_eq!(config.node_id, "04abcdef");
        assert!(config.ubi_task);
        assert_eq!(config.keystore_dir, repo.path().join("keystore"));
    }

    #[test]
    fn test_missing_node_id_is_an_error() {
        let repo = tempfile::tempdir().unwrap();
        let path = repo.path().display().to_string();
        assert!(Config::from_lookup(lookup(&[("CP_PATH", &path)])).is_err());
    }

    #[test]
    fn test_multi_address() {
        assert_eq!(
            parse_multi_address("/ip4/10.0.0.1/tcp/9000").unwrap(),
            ("10.0.0.1".to_string(), 9000)
        );
        assert!(parse_multi_address("10.0.0.1:9000").is_err());
        assert!(parse_multi_address("/ip4/10.0.0.1/tcp/http").is_err());
    }

    #[test]
    fn test_node_inventory_loaded_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.yaml");
        std::fs::write(
            &path,
            r#"
nodes:
  - name: worker-1
    labels:
      INTEL: "true"
    cpu: 16
    memory: 64 GiB
    storage: "500"
    accelerators:
      NVIDIA 3090: 2
  - name: worker-2
    cpu: "8"
    memory: 32GiB
    storage: 1 TB
"#,
        )
        .unwrap();
        let file = path.display().to_string();

        let config = Config::from_lookup(lookup(&[("CP_NODE_ID", "node-1"), ("CP_NODES", &file)])).unwrap();
        assert_eq!(config.nodes_file.as_deref(), Some(path.as_path()));
        let nodes = config.load_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].capacity, Resources::new(16, 64 * GIB, 500 * GIB));
        assert_eq!(nodes[0].labels["INTEL"], "true");
        assert_eq!(nodes[0].accelerators["NVIDIA 3090"], 2);
        assert_eq!(nodes[1].capacity, Resources::new(8, 32 * GIB, 1 << 40));
        assert!(nodes[1].accelerators.is_empty());
    }

    #[test]
    fn test_node_inventory_accepts_bare_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.yaml");
        std::fs::write(&path, "- name: solo\n  cpu: 4\n  memory: 8\n  storage: 20 GiB\n").unwrap();

        let nodes = read_node_inventory(&path).unwrap();
        assert_eq!(nodes, vec![Node::new("solo", Resources::new(4, 8 * GIB, 20 * GIB))]);
    }

    #[test]
    fn test_node_inventory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.yaml");

        std::fs::write(&path, "- name: a\n  cpu: NaN\n  memory: 8\n  storage: 8\n").unwrap();
        let err = read_node_inventory(&path).unwrap_err();
        assert!(err.to_string().contains("node a: invalid cpu"));

        std::fs::write(
            &path,
            "- name: a\n  cpu: 1\n  memory: 8\n  storage: 8\n- name: a\n  cpu: 1\n  memory: 8\n  storage: 8\n",
        )
        .unwrap();
        assert!(read_node_inventory(&path).unwrap_err().to_string().contains("duplicate node a"));

        assert!(read_node_inventory(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_no_inventory_means_no_nodes() {
        let config = Config::from_lookup(lookup(&[("CP_NODE_ID", "node-1")])).unwrap();
        assert!(config.nodes_file.is_none());
        assert!(config.load_nodes().unwrap().is_empty());
    }
}

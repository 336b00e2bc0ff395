//! The cluster file: the clusters a gateway manages and how each is reached.
//!
//! ```yaml
//! - id: prod-east
//!   displayName: Production (east)
//!   mode: direct
//!   kubeconfig: /etc/fleet/prod-east.kubeconfig
//!   context: admin@prod-east
//! - id: edge-17
//!   mode: agent
//! ```
//!
//! A direct cluster with neither a kubeconfig nor a context is reached with the
//! gateway's own client.

use anyhow::{bail, Context, Result};
use fleet_gateway_core::{ClusterId, ConnectionMode, CredentialRef};
use fleet_gateway_index::{ClusterRegistry, Registration};
use fleet_gateway_k8s::DirectClient;
use serde::Deserialize;
use std::{collections::HashSet, path::Path, path::PathBuf};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    pub id: ClusterId,

    /// Defaults to the cluster's ID.
    #[serde(default)]
    pub display_name: Option<String>,

    pub mode: ConnectionMode,

    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub context: Option<String>,
}

pub fn load(path: &Path) -> Result<Vec<ClusterConfig>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster file {}", path.display()))?;
    parse(&contents).with_context(|| format!("invalid cluster file {}", path.display()))
}

pub fn parse(contents: &str) -> Result<Vec<ClusterConfig>> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let clusters = serde_yaml::from_str::<Vec<ClusterConfig>>(contents)?;

    let mut seen = HashSet::new();
    for cluster in &clusters {
        if cluster.id.as_str().is_empty() {
            bail!("cluster IDs must not be empty");
        }
        if !seen.insert(cluster.id.clone()) {
            bail!("cluster {} is listed more than once", cluster.id);
        }
        if cluster.mode == ConnectionMode::Agent
            && (cluster.kubeconfig.is_some() || cluster.context.is_some())
        {
            bail!("agent-mode cluster {} must not name credentials", cluster.id);
        }
    }
    Ok(clusters)
}

/// Registers each configured cluster, building clients for direct clusters.
pub async fn register(
    registry: &ClusterRegistry,
    clusters: Vec<ClusterConfig>,
    local: &kube::Client,
) -> Result<()> {
    for ClusterConfig {
        id,
        display_name,
        mode,
        kubeconfig,
        context,
    } in clusters
    {
        let display_name = display_name.unwrap_or_else(|| id.to_string());
        let registration = match mode {
            ConnectionMode::Agent => Registration::agent(id.clone(), display_name),
            ConnectionMode::Direct => {
                let credential = CredentialRef {
                    kubeconfig,
                    context,
                };
                let client = if credential == CredentialRef::default() {
                    DirectClient::new(id.clone(), local.clone())
                } else {
                    DirectClient::from_credential(id.clone(), &credential)
                        .await
                        .with_context(|| format!("failed to build a client for cluster {id}"))?
                };
                Registration::direct(id.clone(), display_name, client).with_credential(credential)
            }
        };
        registry.register(registration)?;
        info!(cluster = %id, %mode, "Configured cluster");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clusters() {
        let clusters = parse(
            r#"
- id: prod-east
  displayName: Production (east)
  mode: direct
  kubeconfig: /etc/fleet/prod-east.kubeconfig
  context: admin@prod-east
- id: edge-17
  mode: agent
"#,
        )
        .unwrap();
        assert_eq!(
            clusters,
            vec![
                ClusterConfig {
                    id: ClusterId::from("prod-east"),
                    display_name: Some("Production (east)".to_string()),
                    mode: ConnectionMode::Direct,
                    kubeconfig: Some("/etc/fleet/prod-east.kubeconfig".into()),
                    context: Some("admin@prod-east".to_string()),
                },
                ClusterConfig {
                    id: ClusterId::from("edge-17"),
                    display_name: None,
                    mode: ConnectionMode::Agent,
                    kubeconfig: None,
                    context: None,
                },
            ]
        );
    }

    #[test]
    fn empty_files_have_no_clusters() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("[]").unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_clusters() {
        assert!(parse("- id: a\n  mode: direct\n- id: a\n  mode: agent\n").is_err());
        assert!(parse("- id: a\n  mode: agent\n  context: admin\n").is_err());
        assert!(parse("- id: a\n  mode: tunnel\n").is_err());
        assert!(parse("- id: ''\n  mode: agent\n").is_err());
        assert!(parse("- id: a\n  mode: agent\n  token: secret\n").is_err());
    }
}

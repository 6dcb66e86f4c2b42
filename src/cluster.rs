// Copyright 2024 OpsWerks, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context};
use aws_config::SdkConfig;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::constants::{KUBECONFIG_CLUSTER, KUBECONFIG_CONTEXT, KUBECONFIG_USER};
use crate::errors::{Error, Result};
use crate::utils;

/// Managed-cluster connection data: resolved once at run start, read-only
/// afterward.
pub struct ClusterInfo {
    pub endpoint: String,
    pub certificate_authority: String,
    pub oidc_issuer: String,
}

pub struct ClusterConnection {
    pub client: Client,
    pub info: ClusterInfo,
}

/// Looks up the named EKS cluster, obtains a bearer token through the
/// platform's cluster-auth CLI, and builds the Kubernetes client every
/// downstream declaration runs through.
pub async fn connect(settings: &Settings, aws: &SdkConfig) -> Result<ClusterConnection> {
    let info = lookup(settings, aws)
        .await
        .map_err(Error::ClusterLookupError)?;
    let token = fetch_token(&settings.eks_cluster)
        .await
        .map_err(Error::ClusterLookupError)?;
    let document = generate_kube_config(&info.endpoint, &info.certificate_authority, &token);
    let client = client_from_document(&document)
        .await
        .map_err(Error::ProvisionError)?;
    info!("connected to cluster: {}", settings.eks_cluster);
    Ok(ClusterConnection { client, info })
}

async fn lookup(settings: &Settings, aws: &SdkConfig) -> anyhow::Result<ClusterInfo> {
    let eks = aws_sdk_eks::Client::new(aws);
    let out = eks
        .describe_cluster()
        .name(&settings.eks_cluster)
        .send()
        .await
        .with_context(|| format!("failed to look up cluster: {}", settings.eks_cluster))?;
    let cluster = out
        .cluster()
        .ok_or_else(|| anyhow!("no such cluster: {}", settings.eks_cluster))?;
    let endpoint = cluster
        .endpoint()
        .ok_or_else(|| anyhow!("cluster has no endpoint: {}", settings.eks_cluster))?
        .to_string();
    let certificate_authority = cluster
        .certificate_authority()
        .and_then(|ca| ca.data())
        .ok_or_else(|| anyhow!("cluster has no CA data: {}", settings.eks_cluster))?
        .to_string();
    let oidc_issuer = cluster
        .identity()
        .and_then(|id| id.oidc())
        .and_then(|oidc| oidc.issuer())
        .ok_or_else(|| anyhow!("cluster has no OIDC issuer: {}", settings.eks_cluster))?
        .to_string();
    Ok(ClusterInfo {
        endpoint,
        certificate_authority,
        oidc_issuer,
    })
}

#[derive(Deserialize)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize)]
struct ExecCredentialStatus {
    token: String,
}

async fn fetch_token(cluster_name: &str) -> anyhow::Result<String> {
    let payload = utils::run_cli(
        "aws",
        &[
            "eks",
            "get-token",
            "--cluster-name",
            cluster_name,
            "--output",
            "json",
        ],
    )
    .await
    .context("aws eks get-token failed")?;
    let credential: ExecCredential =
        serde_json::from_str(&payload).context("unexpected get-token payload")?;
    Ok(credential.status.token)
}

// The synthesized client-configuration document. Field names and entry names
// are part of the contract: external tooling parses this exact shape.

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct KubeConfigDocument {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
    users: Vec<NamedUser>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEndpoint,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEndpoint {
    server: String,
    certificate_authority_data: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextReference,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct ContextReference {
    cluster: String,
    user: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserToken,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct UserToken {
    token: String,
}

pub(crate) fn generate_kube_config(
    server: &str,
    cert: &str,
    token: &str,
) -> KubeConfigDocument {
    KubeConfigDocument {
        api_version: String::from("v1"),
        kind: String::from("Config"),
        clusters: vec![NamedCluster {
            name: String::from(KUBECONFIG_CLUSTER),
            cluster: ClusterEndpoint {
                server: server.to_string(),
                certificate_authority_data: cert.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: String::from(KUBECONFIG_CONTEXT),
            context: ContextReference {
                cluster: String::from(KUBECONFIG_CLUSTER),
                user: String::from(KUBECONFIG_USER),
            },
        }],
        current_context: String::from(KUBECONFIG_CONTEXT),
        users: vec![NamedUser {
            name: String::from(KUBECONFIG_USER),
            user: UserToken {
                token: token.to_string(),
            },
        }],
    }
}

async fn client_from_document(document: &KubeConfigDocument) -> anyhow::Result<Client> {
    let raw = serde_json::to_string(document)?;
    let kubeconfig: Kubeconfig =
        serde_json::from_str(&raw).context("synthesized kubeconfig did not parse")?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to build client config from kubeconfig")?;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use crate::cluster::{generate_kube_config, ExecCredential, KubeConfigDocument};
    use kube::config::Kubeconfig;

    const SERVER: &str = "https://ABCD1234.gr7.us-west-2.eks.amazonaws.com";
    const CA: &str = "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t";
    const TOKEN: &str = "k8s-aws-v1.aHR0cHM6Ly9zdHM";

    #[test]
    pub fn kube_config_round_trips_through_json() {
        let document = generate_kube_config(SERVER, CA, TOKEN);
        let raw = serde_json::to_string(&document).unwrap();
        let parsed: KubeConfigDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, document);
    }

    #[test]
    pub fn kube_config_matches_the_client_schema() {
        let raw = serde_json::to_string(&generate_kube_config(SERVER, CA, TOKEN)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "Config");
        assert_eq!(value["clusters"][0]["cluster"]["server"], SERVER);
        assert_eq!(
            value["clusters"][0]["cluster"]["certificate-authority-data"],
            CA
        );
        assert_eq!(value["current-context"], "data-group");
        assert_eq!(value["users"][0]["user"]["token"], TOKEN);
        assert_eq!(
            value["contexts"][0]["context"]["user"],
            "data-group-token-user"
        );
    }

    #[test]
    pub fn kube_config_is_consumable_by_the_kube_client() {
        let raw = serde_json::to_string(&generate_kube_config(SERVER, CA, TOKEN)).unwrap();
        let kubeconfig: Kubeconfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("data-group"));
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some(SERVER));
        let user = kubeconfig.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.token.is_some());
    }

    #[test]
    pub fn exec_credential_payload_parses() {
        let payload = r#"{
            "kind": "ExecCredential",
            "apiVersion": "client.authentication.k8s.io/v1beta1",
            "spec": {},
            "status": {
                "expirationTimestamp": "2024-06-01T00:14:00Z",
                "token": "k8s-aws-v1.aHR0cHM6Ly9zdHM"
            }
        }"#;
        let credential: ExecCredential = serde_json::from_str(payload).unwrap();
        assert_eq!(credential.status.token, "k8s-aws-v1.aHR0cHM6Ly9zdHM");
    }
}

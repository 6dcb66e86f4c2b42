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

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{Error, Result};

/// Static run configuration, loaded once at startup.
///
/// Every key not carrying a default is required; a missing key or a value of
/// the wrong shape (e.g. a non-boolean `deploy`) fails the load before any
/// resource is declared.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    pub eks_cluster: String,
    pub ecr_repo: String,
    pub account: String,
    pub namespace: String,
    pub tags: BTreeMap<String, String>,
    pub chart_name: String,
    pub gh_secret: String,
    pub org_allow: String,
    pub user_domain: String,
    pub user_namespace: String,
    pub user_svc_account: String,
    pub vault: String,
    pub item: String,
    pub deploy: bool,
    #[serde(default = "default_interns")]
    pub interns: u32,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub notebooks_repo: Option<String>,
    #[serde(default = "default_s3_access_policy")]
    pub s3_access_policy: String,
    #[serde(default = "default_image_context")]
    pub image_context: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default)]
    pub quota: QuotaPolicy,
}

/// Per-tenant resource ceiling. One shared value: every intern namespace
/// receives the identical quota.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaPolicy {
    #[serde(default = "default_quota_pods")]
    pub pods: u32,
    #[serde(default = "default_quota_memory")]
    pub memory: String,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy {
            pods: default_quota_pods(),
            memory: default_quota_memory(),
        }
    }
}

fn default_interns() -> u32 {
    2
}

fn default_s3_access_policy() -> String {
    String::from("arn:aws:iam::aws:policy/AmazonS3FullAccess")
}

fn default_image_context() -> String {
    String::from("./image")
}

fn default_dockerfile() -> String {
    String::from("./image/Dockerfile")
}

fn default_quota_pods() -> u32 {
    3
}

fn default_quota_memory() -> String {
    String::from("5Gi")
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_yaml::from_str(&raw).map_err(|e| {
            Error::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tags.contains_key("purpose") {
            return Err(Error::ConfigError(String::from(
                "tags must contain a \"purpose\" entry",
            )));
        }
        Ok(())
    }

    /// The `purpose` tag doubles as the app name in the public hostname and
    /// the rendered chart values.
    pub fn purpose(&self) -> &str {
        self.tags
            .get("purpose")
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Public Hub hostname. The OAuth callback URL and the DNS record both
    /// derive from this one value.
    pub fn public_host(&self) -> String {
        format!("{}-{}.{}", self.purpose(), self.chart_name, self.user_domain)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::Settings;

    pub(crate) const SAMPLE_CONFIG: &str = r#"
eks-cluster: academy-cluster
ecr-repo: academy-labs
account: "123456789012"
namespace: jhub
tags:
  purpose: intro
  owner: academy
chart-name: jupyterhub
gh-secret: gh-credentials
org-allow: opswerks-academy
user-domain: lab.opswerks.net
user-namespace: lab-interns
user-svc-account: intern
vault: Academy
item: github-oauth
deploy: true
"#;

    pub(crate) fn sample() -> Settings {
        let settings: Settings = serde_yaml::from_str(SAMPLE_CONFIG).unwrap();
        settings.validate().unwrap();
        settings
    }

    #[test]
    fn parses_required_keys_and_defaults() {
        let settings = sample();
        assert_eq!(settings.eks_cluster, "academy-cluster");
        assert_eq!(settings.user_svc_account, "intern");
        assert!(settings.deploy);
        assert_eq!(settings.interns, 2);
        assert_eq!(settings.quota.pods, 3);
        assert_eq!(settings.quota.memory, "5Gi");
        assert_eq!(
            settings.s3_access_policy,
            "arn:aws:iam::aws:policy/AmazonS3FullAccess"
        );
        assert!(settings.admins.is_empty());
    }

    #[test]
    fn missing_required_key_fails() {
        let without_vault = SAMPLE_CONFIG.replace("vault: Academy\n", "");
        assert!(serde_yaml::from_str::<Settings>(&without_vault).is_err());
    }

    #[test]
    fn non_boolean_deploy_fails() {
        let invalid = SAMPLE_CONFIG.replace("deploy: true", "deploy: maybe");
        assert!(serde_yaml::from_str::<Settings>(&invalid).is_err());
    }

    #[test]
    fn tags_without_purpose_fail_validation() {
        let invalid = SAMPLE_CONFIG.replace("  purpose: intro\n", "");
        let settings: Settings = serde_yaml::from_str(&invalid).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn quota_override_is_shared_policy() {
        let overridden = format!("{}\nquota:\n  pods: 5\n  memory: 8Gi\n", SAMPLE_CONFIG);
        let settings: Settings = serde_yaml::from_str(&overridden).unwrap();
        assert_eq!(settings.quota.pods, 5);
        assert_eq!(settings.quota.memory, "8Gi");
    }

    #[test]
    fn public_host_derives_from_purpose_chart_and_domain() {
        assert_eq!(sample().public_host(), "intro-jupyterhub.lab.opswerks.net");
    }
}

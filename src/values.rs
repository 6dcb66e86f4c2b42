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

//! Typed model of the Hub chart's values document. The document is
//! regenerated and written to disk on every run; nothing is cached or
//! diffed against a previous render.

use std::collections::BTreeMap;
use std::fs;

use anyhow::Context;
use log::info;
use serde::Serialize;

use crate::config::Settings;
use crate::constants::{IMAGE_TAG, PULL_SECRET_NAME, VALUES_PATH};

#[derive(Serialize)]
pub(crate) struct HelmValues {
    hub: Hub,
    singleuser: SingleUser,
    #[serde(rename = "prePuller")]
    pre_puller: PrePuller,
    proxy: Proxy,
    cull: Cull,
    debug: DebugFlags,
}

#[derive(Serialize)]
struct Hub {
    config: HubConfig,
    #[serde(rename = "extraEnv")]
    extra_env: Vec<EnvEntry>,
    #[serde(rename = "extraConfig")]
    extra_config: BTreeMap<String, String>,
    #[serde(rename = "serviceAccount")]
    service_account: ServiceAccountReference,
}

#[derive(Serialize)]
struct HubConfig {
    #[serde(rename = "JupyterHub")]
    jupyter_hub: HubFlags,
}

#[derive(Serialize)]
struct HubFlags {
    admin_access: bool,
    allow_named_servers: bool,
    cleanup_servers: bool,
    cleanup_proxy: bool,
    concurrent_spawn_limit: u32,
    shutdown_on_logout: bool,
}

#[derive(Serialize)]
struct EnvEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(rename = "valueFrom", skip_serializing_if = "Option::is_none")]
    value_from: Option<ValueFrom>,
}

#[derive(Serialize)]
struct ValueFrom {
    #[serde(rename = "secretKeyRef")]
    secret_key_ref: SecretKeyRef,
}

#[derive(Serialize)]
struct SecretKeyRef {
    name: String,
    key: String,
}

#[derive(Serialize)]
struct ServiceAccountReference {
    create: bool,
    name: String,
}

#[derive(Serialize)]
struct SingleUser {
    image: Image,
    #[serde(rename = "serviceAccountName")]
    service_account_name: String,
    #[serde(rename = "cloudMetadata")]
    cloud_metadata: CloudMetadata,
    #[serde(rename = "allowPrivilegeEscalation")]
    allow_privilege_escalation: bool,
    #[serde(rename = "lifecycleHooks", skip_serializing_if = "Option::is_none")]
    lifecycle_hooks: Option<LifecycleHooks>,
}

#[derive(Serialize)]
struct Image {
    name: String,
    tag: String,
    #[serde(rename = "pullPolicy")]
    pull_policy: String,
    #[serde(rename = "pullSecrets")]
    pull_secrets: Vec<String>,
}

#[derive(Serialize)]
struct CloudMetadata {
    #[serde(rename = "blockWithIptables")]
    block_with_iptables: bool,
}

#[derive(Serialize)]
struct LifecycleHooks {
    #[serde(rename = "postStart")]
    post_start: PostStart,
}

#[derive(Serialize)]
struct PostStart {
    exec: ExecHook,
}

#[derive(Serialize)]
struct ExecHook {
    command: Vec<String>,
}

#[derive(Serialize)]
struct PrePuller {
    hook: HookFlag,
}

#[derive(Serialize)]
struct HookFlag {
    enabled: bool,
}

#[derive(Serialize)]
struct Proxy {
    service: ProxyService,
}

#[derive(Serialize)]
struct ProxyService {
    #[serde(rename = "type")]
    type_: String,
}

#[derive(Serialize)]
struct Cull {
    #[serde(rename = "maxAge")]
    max_age: u64,
}

#[derive(Serialize)]
struct DebugFlags {
    enabled: bool,
}

// Selectable lab profiles: named option sets mapping a module choice to a
// memory-limit override.
const PROFILE_LIST: &str = r#"c.KubeSpawner.profile_list = [
  {
      'display_name': 'A1T-ITN1: Introduction to Networks',
      'description': 'A list of exercise(s) to understand the basic(s) of Networks through the CLI',
      'slug': 'a1t-itn1-exercises',
      'default': True,
      'profile_options': {
          'module': {
              'display_name': 'Module(s)',
              'choices': {
                  'curl': {
                      'display_name': 'API Basic(s) through Curl',
                      'kubespawner_override': {'mem_limit': '1G'},
                  },
                  'openssl': {
                      'display_name': 'SSL/TLS/mTLS Basic(s) through OpenSSL',
                      'kubespawner_override': {'mem_limit': '2G'},
                  }
              }
          }
      }
  },
  {
      'display_name': 'AWS Community 2023: Ephemeral Labs Demo',
      'description': 'A list of exercise(s) to demo Ephemeral Labs',
      'slug': 'aws-community-2023-exercises',
      'profile_options': {
          'module': {
              'display_name': 'Module(s)',
              'choices': {
                  'aws_demo': {
                      'display_name': 'Curl/OpenSSL/AWSCLI Exercise(s)',
                      'kubespawner_override': {'mem_limit': '2G'},
                  }
              }
          }
      }
  }
]
"#;

fn build_extra_config(settings: &Settings) -> String {
    let mut config = String::new();
    config.push_str("c.Spawner.start_timeout = 300\n");
    config.push_str("c.JupyterHub.authenticator_class = 'github'\n");
    config.push_str("c.GitHubOAuthenticator.client_id = os.environ['GITHUB_CLIENT_ID']\n");
    config.push_str("c.GitHubOAuthenticator.client_secret = os.environ['GITHUB_CLIENT_SECRET']\n");
    config
        .push_str("c.GitHubOAuthenticator.oauth_callback_url = os.environ['OAUTH_CALLBACK_URL']\n");
    config.push_str(&format!(
        "c.GitHubOAuthenticator.allowed_organizations = ['{}']\n",
        settings.org_allow
    ));
    config.push_str("c.GitHubOAuthenticator.scope = ['read:org']\n");
    if !settings.admins.is_empty() {
        let admins = settings
            .admins
            .iter()
            .map(|admin| format!("'{}'", admin))
            .collect::<Vec<_>>()
            .join(", ");
        config.push_str(&format!("c.Authenticator.admin_users = {{{}}}\n", admins));
    }
    config.push_str("c.KubeSpawner.enable_user_namespaces = True\n");
    config.push_str("c.KubeSpawner.user_namespace_template = u'lab-{username}'\n");
    config.push_str(&format!(
        "c.KubeSpawner.environment = {{\n    'JUPYTERHUB_API_URL': 'http://hub.{}.svc.cluster.local:8081/hub/api'\n}}\n",
        settings.namespace
    ));
    config.push_str(PROFILE_LIST);
    config
}

pub(crate) fn build(settings: &Settings, repository_uri: &str) -> HelmValues {
    let mut extra_config = BTreeMap::new();
    extra_config.insert(String::from("extra_config.py"), build_extra_config(settings));

    let lifecycle_hooks = settings.notebooks_repo.as_ref().map(|repo| LifecycleHooks {
        post_start: PostStart {
            exec: ExecHook {
                command: vec![
                    String::from("sh"),
                    String::from("-c"),
                    format!("git clone {} exercises || true", repo),
                ],
            },
        },
    });

    HelmValues {
        hub: Hub {
            config: HubConfig {
                jupyter_hub: HubFlags {
                    admin_access: true,
                    allow_named_servers: true,
                    cleanup_servers: true,
                    cleanup_proxy: true,
                    concurrent_spawn_limit: 5,
                    shutdown_on_logout: true,
                },
            },
            extra_env: vec![
                EnvEntry {
                    name: String::from("OAUTH_CALLBACK_URL"),
                    value: Some(format!("https://{}/hub/oauth_callback", settings.public_host())),
                    value_from: None,
                },
                EnvEntry {
                    name: String::from("GITHUB_CLIENT_ID"),
                    value: None,
                    value_from: Some(ValueFrom {
                        secret_key_ref: SecretKeyRef {
                            name: settings.gh_secret.clone(),
                            key: String::from("id"),
                        },
                    }),
                },
                EnvEntry {
                    name: String::from("GITHUB_CLIENT_SECRET"),
                    value: None,
                    value_from: Some(ValueFrom {
                        secret_key_ref: SecretKeyRef {
                            name: settings.gh_secret.clone(),
                            key: String::from("secret"),
                        },
                    }),
                },
            ],
            extra_config,
            service_account: ServiceAccountReference {
                create: false,
                name: format!("{}-svc-account", settings.chart_name),
            },
        },
        singleuser: SingleUser {
            image: Image {
                name: repository_uri.to_string(),
                tag: String::from(IMAGE_TAG),
                pull_policy: String::from("IfNotPresent"),
                pull_secrets: vec![String::from(PULL_SECRET_NAME)],
            },
            service_account_name: format!("{}-svc-account", settings.user_svc_account),
            cloud_metadata: CloudMetadata {
                block_with_iptables: false,
            },
            allow_privilege_escalation: true,
            lifecycle_hooks,
        },
        pre_puller: PrePuller {
            hook: HookFlag { enabled: false },
        },
        proxy: Proxy {
            service: ProxyService {
                type_: String::from("NodePort"),
            },
        },
        cull: Cull { max_age: 604800 },
        debug: DebugFlags { enabled: true },
    }
}

pub(crate) fn render(settings: &Settings, repository_uri: &str) -> anyhow::Result<String> {
    serde_yaml::to_string(&build(settings, repository_uri))
        .context("failed to serialize chart values")
}

/// Writes the rendered document to its well-known path, overwriting any
/// previous render.
pub fn write(settings: &Settings, repository_uri: &str) -> anyhow::Result<String> {
    let rendered = render(settings, repository_uri)?;
    fs::write(VALUES_PATH, &rendered)
        .with_context(|| format!("failed to write {}", VALUES_PATH))?;
    info!("rendered chart values to {}", VALUES_PATH);
    Ok(rendered)
}

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

use anyhow::{anyhow, Context};
use aws_config::SdkConfig;
use aws_sdk_ecr::types::{ImageTagMutability, Tag};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Api, Client};
use log::{debug, info};
use serde::Serialize;

use crate::config::Settings;
use crate::constants::{IMAGE_PLATFORM, IMAGE_TAG, PULL_SECRET_NAME};
use crate::utils;

/// Short-lived registry authorization. No `Debug`: the password is consumed
/// by the image push and the pull secret, never by the log output.
pub(crate) struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub registry_host: String,
}

pub struct RegistryOutput {
    pub repository_uri: String,
}

/// Ensures the repository exists, builds and pushes the lab image, and
/// materializes the registry credentials as an in-cluster pull secret.
pub async fn ensure(
    client: &Client,
    settings: &Settings,
    aws: &SdkConfig,
) -> anyhow::Result<RegistryOutput> {
    let ecr = aws_sdk_ecr::Client::new(aws);
    let repository_uri = ensure_repository(&ecr, settings).await?;
    let credentials = fetch_credentials(&ecr).await?;
    build_and_push(settings, &credentials, &repository_uri).await?;
    ensure_pull_secret(client, settings, &credentials).await?;
    info!("ensured lab image: {}:{}", repository_uri, IMAGE_TAG);
    Ok(RegistryOutput { repository_uri })
}

/// The repository name is a stable identifier: reused when present, created
/// once when absent, never force-deleted.
async fn ensure_repository(
    ecr: &aws_sdk_ecr::Client,
    settings: &Settings,
) -> anyhow::Result<String> {
    let existing = match ecr
        .describe_repositories()
        .repository_names(&settings.ecr_repo)
        .send()
        .await
    {
        Ok(out) => out
            .repositories()
            .first()
            .and_then(|repo| repo.repository_uri())
            .map(String::from),
        Err(err) => {
            let err = err.into_service_error();
            if err.is_repository_not_found_exception() {
                None
            } else {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to describe repository: {}", settings.ecr_repo));
            }
        }
    };
    if let Some(uri) = existing {
        debug!("reusing repository: {}", settings.ecr_repo);
        return Ok(uri);
    }

    let tags = settings
        .tags
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect::<Result<Vec<_>, _>>()?;
    let out = ecr
        .create_repository()
        .repository_name(&settings.ecr_repo)
        .image_tag_mutability(ImageTagMutability::Mutable)
        .set_tags(Some(tags))
        .send()
        .await
        .with_context(|| format!("failed to create repository: {}", settings.ecr_repo))?;
    out.repository()
        .and_then(|repo| repo.repository_uri())
        .map(String::from)
        .ok_or_else(|| anyhow!("created repository has no URI: {}", settings.ecr_repo))
}

async fn fetch_credentials(ecr: &aws_sdk_ecr::Client) -> anyhow::Result<RegistryCredentials> {
    let out = ecr
        .get_authorization_token()
        .send()
        .await
        .context("failed to fetch registry authorization token")?;
    let authorization = out
        .authorization_data()
        .first()
        .ok_or_else(|| anyhow!("registry returned no authorization data"))?;
    let token = authorization
        .authorization_token()
        .ok_or_else(|| anyhow!("registry authorization data has no token"))?;
    let (username, password) = decode_authorization_token(token)?;
    let registry_host = authorization
        .proxy_endpoint()
        .map(utils::strip_scheme)
        .ok_or_else(|| anyhow!("registry authorization data has no endpoint"))?
        .to_string();
    Ok(RegistryCredentials {
        username,
        password,
        registry_host,
    })
}

/// The authorization token is base64 over `user:password`.
pub(crate) fn decode_authorization_token(token: &str) -> anyhow::Result<(String, String)> {
    let decoded = STANDARD
        .decode(token)
        .context("registry token is not base64")?;
    let decoded = String::from_utf8(decoded).context("registry token is not UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| anyhow!("registry token has no user:password separator"))?;
    Ok((username.to_string(), password.to_string()))
}

/// Builds the lab image for the fixed target platform and pushes it tagged
/// `latest`. Build and push failures propagate unretried.
async fn build_and_push(
    settings: &Settings,
    credentials: &RegistryCredentials,
    repository_uri: &str,
) -> anyhow::Result<()> {
    let image = format!("{}:{}", repository_uri, IMAGE_TAG);
    utils::run_cli_with_stdin(
        "docker",
        &[
            "login",
            "--username",
            &credentials.username,
            "--password-stdin",
            &credentials.registry_host,
        ],
        &credentials.password,
    )
    .await
    .context("docker login failed")?;
    utils::run_cli(
        "docker",
        &[
            "build",
            "--platform",
            IMAGE_PLATFORM,
            "--file",
            &settings.dockerfile,
            "--tag",
            &image,
            &settings.image_context,
        ],
    )
    .await
    .context("lab image build failed")?;
    utils::run_cli("docker", &["push", &image])
        .await
        .context("lab image push failed")?;
    Ok(())
}

#[derive(Serialize)]
struct DockerConfig {
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Serialize)]
struct DockerAuth {
    username: String,
    password: String,
}

pub(crate) fn dockerconfig_json(
    registry_host: &str,
    username: &str,
    password: &str,
) -> anyhow::Result<String> {
    let mut auths = BTreeMap::new();
    auths.insert(
        registry_host.to_string(),
        DockerAuth {
            username: username.to_string(),
            password: password.to_string(),
        },
    );
    Ok(serde_json::to_string(&DockerConfig { auths })?)
}

async fn ensure_pull_secret(
    client: &Client,
    settings: &Settings,
    credentials: &RegistryCredentials,
) -> anyhow::Result<()> {
    let config_json = dockerconfig_json(
        &credentials.registry_host,
        &credentials.username,
        &credentials.password,
    )?;
    let mut data = BTreeMap::new();
    data.insert(
        String::from(".dockerconfigjson"),
        ByteString(config_json.into_bytes()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(String::from(PULL_SECRET_NAME)),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        },
        type_: Some(String::from("kubernetes.io/dockerconfigjson")),
        data: Some(data),
        ..Default::default()
    };
    let api: Api<Secret> = Api::namespaced(client.clone(), &settings.namespace);
    utils::apply(&api, PULL_SECRET_NAME, &secret).await?;
    debug!("ensured pull secret: {}", PULL_SECRET_NAME);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::registry::{decode_authorization_token, dockerconfig_json};

    #[test]
    pub fn decode_authorization_token_splits_user_and_password() {
        // base64("AWS:secret")
        let (username, password) = decode_authorization_token("QVdTOnNlY3JldA==").unwrap();
        assert_eq!(username, "AWS");
        assert_eq!(password, "secret");
    }

    #[test]
    pub fn decode_authorization_token_rejects_tokens_without_separator() {
        // base64("no-separator")
        assert!(decode_authorization_token("bm8tc2VwYXJhdG9y").is_err());
    }

    #[test]
    pub fn decode_authorization_token_rejects_non_base64_input() {
        assert!(decode_authorization_token("%%not-base64%%").is_err());
    }

    #[test]
    pub fn dockerconfig_json_produces_the_expected_auths_shape() {
        let raw = dockerconfig_json(
            "123456789012.dkr.ecr.us-west-2.amazonaws.com",
            "AWS",
            "secret",
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let auth = &value["auths"]["123456789012.dkr.ecr.us-west-2.amazonaws.com"];
        assert_eq!(auth["username"], "AWS");
        assert_eq!(auth["password"], "secret");
    }
}

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

use anyhow::Context;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Api, Client};
use log::info;
use serde::Deserialize;

use crate::config::Settings;
use crate::errors::{Error, Result};
use crate::utils;

/// GitHub OAuth application credentials. Intentionally no `Debug`: these are
/// consumed once and must never reach the log output.
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Deserialize)]
struct VaultField {
    value: String,
}

/// Resolves the OAuth client id/secret from the 1Password vault configured in
/// [`Settings`]. Invoked once at the start of a run; any failure aborts the
/// run before a single cloud resource is declared.
pub async fn resolve_oauth(settings: &Settings) -> Result<OAuthCredentials> {
    // An existing CLI session is fine; the item fetches below authenticate
    // the hard way.
    let _ = utils::run_cli("op", &["signin"]).await;

    let client_id = fetch_field(settings, "username")
        .await
        .map_err(Error::CredentialError)?;
    let client_secret = fetch_field(settings, "password")
        .await
        .map_err(Error::CredentialError)?;
    info!("resolved OAuth credentials from vault: {}", settings.vault);
    Ok(OAuthCredentials {
        client_id,
        client_secret,
    })
}

async fn fetch_field(settings: &Settings, field: &str) -> anyhow::Result<String> {
    let payload = utils::run_cli(
        "op",
        &[
            "--vault",
            &settings.vault,
            "item",
            "get",
            &settings.item,
            "--field",
            field,
            "--format",
            "json",
        ],
    )
    .await
    .with_context(|| format!("op item get failed for field: {}", field))?;
    parse_value(&payload).with_context(|| format!("bad op payload for field: {}", field))
}

fn parse_value(payload: &str) -> anyhow::Result<String> {
    let field: VaultField =
        serde_json::from_str(payload).context("expected JSON with a value field")?;
    Ok(field.value)
}

/// Declares the `Opaque` secret the Hub reads the OAuth credentials from. The
/// API server base64-encodes the `data` values on the wire.
pub async fn materialize_oauth_secret(
    client: &Client,
    settings: &Settings,
    creds: &OAuthCredentials,
) -> anyhow::Result<()> {
    let mut data = BTreeMap::new();
    data.insert(
        String::from("id"),
        ByteString(creds.client_id.clone().into_bytes()),
    );
    data.insert(
        String::from("secret"),
        ByteString(creds.client_secret.clone().into_bytes()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(settings.gh_secret.clone()),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        },
        type_: Some(String::from("Opaque")),
        data: Some(data),
        ..Default::default()
    };
    let api: Api<Secret> = Api::namespaced(client.clone(), &settings.namespace);
    utils::apply(&api, &settings.gh_secret, &secret).await?;
    info!("ensured OAuth secret: {}", settings.gh_secret);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::secrets::parse_value;

    #[test]
    pub fn parse_value_reads_the_value_field() {
        let payload = r#"{"id":"aaa","label":"username","type":"STRING","value":"iv-client-id"}"#;
        assert_eq!(parse_value(payload).unwrap(), "iv-client-id");
    }

    #[test]
    pub fn parse_value_rejects_payload_without_value_field() {
        assert!(parse_value(r#"{"id":"aaa","label":"username"}"#).is_err());
    }

    #[test]
    pub fn parse_value_rejects_malformed_json() {
        assert!(parse_value("[ERROR] 2024/01/01 not signed in").is_err());
    }
}

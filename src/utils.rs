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

use std::fmt::Debug;
use std::process::Stdio;

use anyhow::{anyhow, Context};
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::constants::PROVISIONER_NAME;

/// Runs an external CLI and returns its stdout. A non-zero exit surfaces the
/// command's stderr in the error.
pub(crate) async fn run_cli(program: &str, args: &[&str]) -> anyhow::Result<String> {
    debug!("running external command: {}", program);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Same as [`run_cli`], but feeds `input` on stdin. Used where a credential
/// must not appear in the argument list.
pub(crate) async fn run_cli_with_stdin(
    program: &str,
    args: &[&str],
    input: &str,
) -> anyhow::Result<String> {
    debug!("running external command: {}", program);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to open stdin for {}", program))?;
    stdin.write_all(input.as_bytes()).await?;
    drop(stdin);
    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Idempotent declaration of a Kubernetes object: create it, and fall back to
/// a merge patch when the object already exists.
pub(crate) async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> anyhow::Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            debug!("created {}", name);
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let params = PatchParams {
                field_manager: Some(String::from(PROVISIONER_NAME)),
                ..Default::default()
            };
            api.patch(name, &params, &Patch::Merge(obj))
                .await
                .with_context(|| format!("failed to update existing object: {}", name))?;
            debug!("updated {}", name);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to create object: {}", name)),
    }
}

/// Strips the URL scheme, leaving the bare host (and path, if any). OIDC
/// issuer condition keys and registry hosts are scheme-less.
pub(crate) fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use crate::utils::strip_scheme;

    #[test]
    pub fn strip_scheme_removes_https_prefix() {
        assert_eq!(
            strip_scheme("https://oidc.eks.us-west-2.amazonaws.com/id/ABCD"),
            "oidc.eks.us-west-2.amazonaws.com/id/ABCD"
        );
    }

    #[test]
    pub fn strip_scheme_leaves_bare_hosts_untouched() {
        assert_eq!(
            strip_scheme("123456789012.dkr.ecr.us-west-2.amazonaws.com"),
            "123456789012.dkr.ecr.us-west-2.amazonaws.com"
        );
    }
}

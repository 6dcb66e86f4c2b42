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

use aws_config::BehaviorVersion;
use log::info;

use crate::config::Settings;
use crate::constants::DEFAULT_REGION;
use crate::errors::{Error, Result};
use crate::{cluster, helm, ingress, rbac, registry, secrets, tenants, values};

/// One provisioning run. Declarations are idempotent; a mid-run failure
/// leaves already-created resources standing for the next apply or destroy
/// cycle, with no compensating rollback here.
pub async fn run(settings: Settings) -> Result<()> {
    info!("starting lab provisioning run....");

    // Credentials first: nothing is declared in the cloud until they resolve.
    let creds = secrets::resolve_oauth(&settings).await?;

    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let connection = cluster::connect(&settings, &aws).await?;
    let client = connection.client;

    // The registry/image pipeline and the platform RBAC touch disjoint
    // resources.
    let (registry_out, _) = tokio::try_join!(
        registry::ensure(&client, &settings, &aws),
        rbac::ensure(&client, &settings),
    )
    .map_err(Error::ProvisionError)?;

    secrets::materialize_oauth_secret(&client, &settings, &creds)
        .await
        .map_err(Error::ProvisionError)?;

    tenants::provision_all(&client, &settings, &aws, &connection.info.oidc_issuer)
        .await
        .map_err(Error::ProvisionError)?;

    values::write(&settings, &registry_out.repository_uri).map_err(Error::ProvisionError)?;

    let region = aws
        .region()
        .map(|region| region.as_ref().to_string())
        .unwrap_or_else(|| String::from(DEFAULT_REGION));
    helm::ensure_cluster_autoscaler(&settings, &region)
        .await
        .map_err(Error::ProvisionError)?;
    helm::run_chart_operation(&settings)
        .await
        .map_err(Error::ProvisionError)?;

    ingress::publish(&client, &settings, &aws).await?;

    info!("lab provisioning run complete");
    Ok(())
}

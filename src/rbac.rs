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

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use log::info;

use crate::config::Settings;
use crate::utils;

pub(crate) const MANAGE_VERBS: [&str; 7] = [
    "get", "list", "watch", "create", "update", "patch", "delete",
];

fn verbs() -> Vec<String> {
    MANAGE_VERBS.iter().map(|v| v.to_string()).collect()
}

/// Declares the cluster-wide role, service account, and binding the Hub
/// orchestrator runs under.
pub async fn ensure(client: &Client, settings: &Settings) -> anyhow::Result<()> {
    let role = hub_cluster_role(settings);
    let account = hub_service_account(settings);
    let binding = hub_binding(settings);

    let roles: Api<ClusterRole> = Api::all(client.clone());
    utils::apply(&roles, role.metadata.name.as_deref().unwrap_or_default(), &role).await?;
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &settings.namespace);
    utils::apply(
        &accounts,
        account.metadata.name.as_deref().unwrap_or_default(),
        &account,
    )
    .await?;
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    utils::apply(
        &bindings,
        binding.metadata.name.as_deref().unwrap_or_default(),
        &binding,
    )
    .await?;
    info!("ensured platform RBAC for chart: {}", settings.chart_name);
    Ok(())
}

/// Wildcard grant over every API group and resource type. Known
/// over-privilege: the Hub creates and tears down arbitrary child resources
/// in per-user namespaces, so the grant cannot be enumerated up front.
pub(crate) fn hub_cluster_role(settings: &Settings) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(format!("{}-cluster-role", settings.chart_name)),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::from("*")]),
            resources: Some(vec![String::from("*")]),
            verbs: verbs(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub(crate) fn hub_service_account(settings: &Settings) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(format!("{}-svc-account", settings.chart_name)),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn hub_binding(settings: &Settings) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-crole-binding", settings.chart_name)),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: String::from("ServiceAccount"),
            name: format!("{}-svc-account", settings.chart_name),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: String::from("rbac.authorization.k8s.io"),
            kind: String::from("ClusterRole"),
            name: format!("{}-cluster-role", settings.chart_name),
        },
    }
}

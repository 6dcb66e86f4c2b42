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
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{
    Namespace, ResourceQuota, ResourceQuotaSpec, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use log::info;
use serde::Serialize;

use crate::config::{QuotaPolicy, Settings};
use crate::constants::{ROLE_ARN_ANNOTATION_KEY, STS_AUDIENCE};
use crate::rbac::MANAGE_VERBS;
use crate::utils;

/// Every name a tenant owns, derived from one value. The federation subject
/// is computed from the same fields as the service-account name, so the two
/// can never drift apart.
pub(crate) struct TenantNames {
    pub namespace: String,
    pub account_base: String,
}

impl TenantNames {
    pub(crate) fn new(settings: &Settings, index: u32) -> TenantNames {
        TenantNames {
            namespace: format!("{}-{}", settings.user_namespace, index),
            account_base: format!("{}-{}", settings.user_svc_account, index),
        }
    }

    pub(crate) fn service_account(&self) -> String {
        format!("{}-svc-account", self.account_base)
    }

    pub(crate) fn role(&self) -> String {
        format!("{}-role", self.account_base)
    }

    pub(crate) fn binding(&self) -> String {
        format!("{}-role-binding", self.account_base)
    }

    pub(crate) fn quota(&self) -> String {
        format!("{}-quota", self.account_base)
    }

    pub(crate) fn iam_role(&self) -> String {
        format!("{}-s3-access-role", self.account_base)
    }

    /// Exact, case-sensitive `sub` claim the trust policy matches against.
    /// Any mismatch is a federation denial at assume-role time.
    pub(crate) fn subject(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace,
            self.service_account()
        )
    }
}

/// Provisions every configured intern environment. Tenants touch disjoint
/// namespaces and distinct IAM roles, so they run concurrently.
pub async fn provision_all(
    client: &Client,
    settings: &Settings,
    aws: &SdkConfig,
    oidc_issuer: &str,
) -> anyhow::Result<()> {
    let iam = aws_sdk_iam::Client::new(aws);
    try_join_all(
        (0..settings.interns).map(|i| provision(client, &iam, settings, oidc_issuer, i)),
    )
    .await?;
    info!("provisioned {} intern environments", settings.interns);
    Ok(())
}

/// One tenant: IAM role first (the service-account annotation needs its ARN),
/// then namespace, service account, role, binding, quota. A failure leaves
/// whatever was already declared in place for the next apply cycle.
async fn provision(
    client: &Client,
    iam: &aws_sdk_iam::Client,
    settings: &Settings,
    oidc_issuer: &str,
    index: u32,
) -> anyhow::Result<()> {
    let names = TenantNames::new(settings, index);
    let role_arn = ensure_access_role(
        iam,
        &names,
        &settings.account,
        utils::strip_scheme(oidc_issuer),
        &settings.s3_access_policy,
    )
    .await?;

    let namespaces: Api<Namespace> = Api::all(client.clone());
    utils::apply(&namespaces, &names.namespace, &tenant_namespace(&names, index)).await?;

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &names.namespace);
    utils::apply(
        &accounts,
        &names.service_account(),
        &tenant_service_account(&names, &role_arn),
    )
    .await?;

    let roles: Api<Role> = Api::namespaced(client.clone(), &names.namespace);
    utils::apply(&roles, &names.role(), &tenant_role(&names)).await?;

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), &names.namespace);
    utils::apply(&bindings, &names.binding(), &tenant_binding(&names)).await?;

    let quotas: Api<ResourceQuota> = Api::namespaced(client.clone(), &names.namespace);
    utils::apply(
        &quotas,
        &names.quota(),
        &tenant_quota(&names, &settings.quota),
    )
    .await?;

    info!("provisioned intern environment: {}", names.namespace);
    Ok(())
}

// IAM trust policy, as a document model rather than interpolated JSON.

#[derive(Serialize)]
struct TrustPolicy {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Statement")]
    statement: Vec<TrustStatement>,
}

#[derive(Serialize)]
struct TrustStatement {
    #[serde(rename = "Effect")]
    effect: &'static str,
    #[serde(rename = "Principal")]
    principal: Principal,
    #[serde(rename = "Action")]
    action: &'static str,
    #[serde(rename = "Condition")]
    condition: Condition,
}

#[derive(Serialize)]
struct Principal {
    #[serde(rename = "Federated")]
    federated: String,
}

#[derive(Serialize)]
struct Condition {
    #[serde(rename = "StringEquals")]
    string_equals: BTreeMap<String, String>,
}

/// Permits `AssumeRoleWithWebIdentity` only for the cluster's OIDC provider,
/// the STS audience, and the tenant's exact service-account subject.
fn trust_policy(account: &str, issuer_host: &str, subject: &str) -> TrustPolicy {
    let mut string_equals = BTreeMap::new();
    string_equals.insert(
        format!("{}:aud", issuer_host),
        String::from(STS_AUDIENCE),
    );
    string_equals.insert(format!("{}:sub", issuer_host), subject.to_string());
    TrustPolicy {
        version: "2012-10-17",
        statement: vec![TrustStatement {
            effect: "Allow",
            principal: Principal {
                federated: format!("arn:aws:iam::{}:oidc-provider/{}", account, issuer_host),
            },
            action: "sts:AssumeRoleWithWebIdentity",
            condition: Condition { string_equals },
        }],
    }
}

/// Creates the tenant's federated role, or refreshes its trust document when
/// the role already exists, then attaches the storage-access policy.
async fn ensure_access_role(
    iam: &aws_sdk_iam::Client,
    names: &TenantNames,
    account: &str,
    issuer_host: &str,
    policy_arn: &str,
) -> anyhow::Result<String> {
    let document = serde_json::to_string(&trust_policy(account, issuer_host, &names.subject()))?;
    let role_name = names.iam_role();
    let arn = match iam
        .create_role()
        .role_name(&role_name)
        .assume_role_policy_document(&document)
        .send()
        .await
    {
        Ok(out) => out
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| anyhow!("created role has no ARN: {}", role_name))?,
        Err(err) => {
            let err = err.into_service_error();
            if !err.is_entity_already_exists_exception() {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to create role: {}", role_name));
            }
            iam.update_assume_role_policy()
                .role_name(&role_name)
                .policy_document(&document)
                .send()
                .await
                .with_context(|| format!("failed to update trust policy: {}", role_name))?;
            let out = iam
                .get_role()
                .role_name(&role_name)
                .send()
                .await
                .with_context(|| format!("failed to read back role: {}", role_name))?;
            out.role()
                .map(|role| role.arn().to_string())
                .ok_or_else(|| anyhow!("existing role has no ARN: {}", role_name))?
        }
    };
    iam.attach_role_policy()
        .role_name(&role_name)
        .policy_arn(policy_arn)
        .send()
        .await
        .with_context(|| format!("failed to attach policy to role: {}", role_name))?;
    Ok(arn)
}

pub(crate) fn tenant_namespace(names: &TenantNames, index: u32) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert(
        String::from("environment"),
        format!("intern-environment-{}", index),
    );
    Namespace {
        metadata: ObjectMeta {
            name: Some(names.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn tenant_service_account(names: &TenantNames, role_arn: &str) -> ServiceAccount {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        String::from(ROLE_ARN_ANNOTATION_KEY),
        role_arn.to_string(),
    );
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(names.service_account()),
            namespace: Some(names.namespace.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Narrower than the platform role: the tenant manages only its own pods,
/// secrets, configmaps, and services.
pub(crate) fn tenant_role(names: &TenantNames) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(names.role()),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::from("*")]),
            resources: Some(
                ["pods", "secrets", "configmaps", "services"]
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
            ),
            verbs: MANAGE_VERBS.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }]),
    }
}

pub(crate) fn tenant_binding(names: &TenantNames) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(names.binding()),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: String::from("ServiceAccount"),
            name: names.service_account(),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: String::from("rbac.authorization.k8s.io"),
            kind: String::from("Role"),
            name: names.role(),
        },
    }
}

/// Pod count and memory requests are the sole isolation limits; CPU is left
/// unbounded.
pub(crate) fn tenant_quota(names: &TenantNames, policy: &QuotaPolicy) -> ResourceQuota {
    let mut hard = BTreeMap::new();
    hard.insert(String::from("pods"), Quantity(policy.pods.to_string()));
    hard.insert(
        String::from("requests.memory"),
        Quantity(policy.memory.clone()),
    );
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(names.quota()),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::tests::sample;
    use crate::config::QuotaPolicy;
    use crate::tenants::{
        tenant_binding, tenant_namespace, tenant_quota, tenant_role, tenant_service_account,
        trust_policy, TenantNames,
    };

    #[test]
    pub fn subject_matches_the_federation_contract() {
        let names = TenantNames {
            namespace: String::from("lab-interns"),
            account_base: String::from("intern"),
        };
        assert_eq!(
            names.subject(),
            "system:serviceaccount:lab-interns:intern-svc-account"
        );
    }

    #[test]
    pub fn names_derive_deterministically_from_the_index() {
        let settings = sample();
        let names = TenantNames::new(&settings, 1);
        assert_eq!(names.namespace, "lab-interns-1");
        assert_eq!(names.service_account(), "intern-1-svc-account");
        assert_eq!(names.role(), "intern-1-role");
        assert_eq!(names.binding(), "intern-1-role-binding");
        assert_eq!(names.quota(), "intern-1-quota");
        assert_eq!(names.iam_role(), "intern-1-s3-access-role");
        assert_eq!(
            names.subject(),
            "system:serviceaccount:lab-interns-1:intern-1-svc-account"
        );
    }

    #[test]
    pub fn trust_policy_conditions_pin_audience_and_subject() {
        let issuer = "oidc.eks.us-west-2.amazonaws.com/id/ABCD";
        let names = TenantNames::new(&sample(), 0);
        let policy = trust_policy("123456789012", issuer, &names.subject());
        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(value["Version"], "2012-10-17");
        let statement = &value["Statement"][0];
        assert_eq!(statement["Effect"], "Allow");
        assert_eq!(statement["Action"], "sts:AssumeRoleWithWebIdentity");
        assert_eq!(
            statement["Principal"]["Federated"],
            format!("arn:aws:iam::123456789012:oidc-provider/{}", issuer)
        );
        let conditions = &statement["Condition"]["StringEquals"];
        assert_eq!(conditions[format!("{}:aud", issuer)], "sts.amazonaws.com");
        assert_eq!(
            conditions[format!("{}:sub", issuer)],
            "system:serviceaccount:lab-interns-0:intern-0-svc-account"
        );
    }

    #[test]
    pub fn service_account_carries_the_role_arn_annotation() {
        let names = TenantNames::new(&sample(), 0);
        let account =
            tenant_service_account(&names, "arn:aws:iam::123456789012:role/intern-0-s3-access-role");
        let annotations = account.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("eks.amazonaws.com/role-arn").map(String::as_str),
            Some("arn:aws:iam::123456789012:role/intern-0-s3-access-role")
        );
        assert_eq!(account.metadata.namespace.as_deref(), Some("lab-interns-0"));
    }

    #[test]
    pub fn tenant_role_is_limited_to_four_resource_types() {
        let names = TenantNames::new(&sample(), 0);
        let role = tenant_role(&names);
        let rule = &role.rules.unwrap()[0];
        assert_eq!(
            rule.resources.as_deref(),
            Some(
                &[
                    "pods".to_string(),
                    "secrets".to_string(),
                    "configmaps".to_string(),
                    "services".to_string()
                ][..]
            )
        );
        assert_eq!(rule.verbs.len(), 7);
    }

    #[test]
    pub fn binding_references_the_tenant_service_account() {
        let names = TenantNames::new(&sample(), 2);
        let binding = tenant_binding(&names);
        let subject = &binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.name, names.service_account());
        assert_eq!(subject.namespace.as_deref(), Some("lab-interns-2"));
        assert_eq!(binding.role_ref.name, "intern-2-role");
    }

    #[test]
    pub fn default_quota_caps_pods_and_memory_only() {
        let names = TenantNames::new(&sample(), 0);
        let quota = tenant_quota(&names, &QuotaPolicy::default());
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard.get("pods").unwrap().0, "3");
        assert_eq!(hard.get("requests.memory").unwrap().0, "5Gi");
        assert!(!hard.contains_key("limits.cpu"));
        assert!(!hard.contains_key("requests.cpu"));
    }

    #[test]
    pub fn quota_policy_propagates_identically_to_every_tenant() {
        let policy = QuotaPolicy {
            pods: 5,
            memory: String::from("8Gi"),
        };
        let settings = sample();
        for index in 0..settings.interns {
            let quota = tenant_quota(&TenantNames::new(&settings, index), &policy);
            let hard = quota.spec.unwrap().hard.unwrap();
            assert_eq!(hard.get("pods").unwrap().0, "5");
            assert_eq!(hard.get("requests.memory").unwrap().0, "8Gi");
        }
    }

    #[test]
    pub fn namespace_is_labelled_as_an_intern_environment() {
        let names = TenantNames::new(&sample(), 1);
        let namespace = tenant_namespace(&names, 1);
        assert_eq!(namespace.metadata.name.as_deref(), Some("lab-interns-1"));
        let labels = namespace.metadata.labels.unwrap();
        assert_eq!(
            labels.get("environment").map(String::as_str),
            Some("intern-environment-1")
        );
    }
}

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
use std::time::Duration;

use anyhow::{anyhow, Context};
use aws_config::SdkConfig;
use aws_sdk_acm::types::CertificateStatus;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use log::{debug, info};

use crate::config::Settings;
use crate::constants::{
    ALB_LISTEN_PORTS, DNS_RECORD_TTL, HUB_PROXY_PORT, HUB_PROXY_SERVICE, INGRESS_NAME,
    INGRESS_STATUS_INTERVAL_SECS, INGRESS_STATUS_RETRIES,
};
use crate::errors::{Error, Result};
use crate::utils;

/// Publishes the Hub: TLS-terminating load-balancer ingress first, then the
/// public CNAME once the load balancer has a hostname. The record declaration
/// waits on the ingress status, never on a fixed delay.
pub async fn publish(client: &Client, settings: &Settings, aws: &SdkConfig) -> Result<()> {
    let certificate_arn = find_certificate(aws, &settings.user_domain)
        .await
        .map_err(Error::ClusterLookupError)?;

    let api: Api<Ingress> = Api::namespaced(client.clone(), &settings.namespace);
    let ingress = hub_ingress(settings, &certificate_arn);
    utils::apply(&api, INGRESS_NAME, &ingress)
        .await
        .map_err(Error::ProvisionError)?;

    let hostname = await_load_balancer(&api)
        .await
        .map_err(Error::ProvisionError)?;
    upsert_cname(settings, aws, &hostname)
        .await
        .map_err(Error::ProvisionError)?;
    info!(
        "published hub at https://{} -> {}",
        settings.public_host(),
        hostname
    );
    Ok(())
}

/// The ingress only exists with TLS: no issued wildcard certificate for the
/// tenant domain aborts the run.
async fn find_certificate(aws: &SdkConfig, domain: &str) -> anyhow::Result<String> {
    let acm = aws_sdk_acm::Client::new(aws);
    let wildcard = format!("*.{}", domain);
    let out = acm
        .list_certificates()
        .certificate_statuses(CertificateStatus::Issued)
        .send()
        .await
        .context("failed to list certificates")?;
    out.certificate_summary_list()
        .iter()
        .find(|summary| summary.domain_name() == Some(wildcard.as_str()))
        .and_then(|summary| summary.certificate_arn())
        .map(String::from)
        .ok_or_else(|| anyhow!("no issued certificate for domain: {}", wildcard))
}

pub(crate) fn hub_ingress(settings: &Settings, certificate_arn: &str) -> Ingress {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        String::from("kubernetes.io/ingress.class"),
        String::from("alb"),
    );
    annotations.insert(
        String::from("alb.ingress.kubernetes.io/scheme"),
        String::from("internet-facing"),
    );
    annotations.insert(
        String::from("alb.ingress.kubernetes.io/listen-ports"),
        String::from(ALB_LISTEN_PORTS),
    );
    annotations.insert(
        String::from("alb.ingress.kubernetes.io/certificate-arn"),
        certificate_arn.to_string(),
    );
    Ingress {
        metadata: ObjectMeta {
            name: Some(String::from(INGRESS_NAME)),
            namespace: Some(settings.namespace.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: String::from(HUB_PROXY_SERVICE),
                                port: Some(ServiceBackendPort {
                                    number: Some(HUB_PROXY_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                        path: Some(String::from("/")),
                        path_type: String::from("Prefix"),
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Polls the admitted ingress until the load balancer reports a hostname.
async fn await_load_balancer(api: &Api<Ingress>) -> anyhow::Result<String> {
    let mut retries = INGRESS_STATUS_RETRIES;
    while retries != 0 {
        let ingress = api.get(INGRESS_NAME).await?;
        if let Some(hostname) = load_balancer_hostname(&ingress) {
            return Ok(hostname);
        }
        debug!(
            "waiting for load balancer hostname on ingress: {}",
            INGRESS_NAME
        );
        tokio::time::sleep(Duration::from_secs(INGRESS_STATUS_INTERVAL_SECS)).await;
        retries -= 1;
    }
    Err(anyhow!(
        "load balancer hostname never assigned for ingress: {}",
        INGRESS_NAME
    ))
}

pub(crate) fn load_balancer_hostname(ingress: &Ingress) -> Option<String> {
    ingress
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .hostname
        .clone()
}

/// Trailing dot stripped: zone names come back fully qualified.
pub(crate) fn zone_matches(zone_name: &str, domain: &str) -> bool {
    zone_name.trim_end_matches('.') == domain
}

async fn upsert_cname(
    settings: &Settings,
    aws: &SdkConfig,
    load_balancer_hostname: &str,
) -> anyhow::Result<()> {
    let route53 = aws_sdk_route53::Client::new(aws);
    let out = route53
        .list_hosted_zones_by_name()
        .dns_name(&settings.user_domain)
        .send()
        .await
        .context("failed to list hosted zones")?;
    let zone = out
        .hosted_zones()
        .iter()
        .find(|zone| zone_matches(zone.name(), &settings.user_domain))
        .ok_or_else(|| anyhow!("no hosted zone for domain: {}", settings.user_domain))?;
    let zone_id = zone
        .id()
        .strip_prefix("/hostedzone/")
        .unwrap_or_else(|| zone.id());

    let record_set = ResourceRecordSet::builder()
        .name(settings.public_host())
        .r#type(RrType::Cname)
        .ttl(DNS_RECORD_TTL)
        .resource_records(
            ResourceRecord::builder()
                .value(load_balancer_hostname)
                .build()?,
        )
        .build()?;
    let batch = ChangeBatch::builder()
        .changes(
            Change::builder()
                .action(ChangeAction::Upsert)
                .resource_record_set(record_set)
                .build()?,
        )
        .build()?;
    route53
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(batch)
        .send()
        .await
        .with_context(|| format!("failed to upsert record: {}", settings.public_host()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::tests::sample;
    use crate::ingress::{hub_ingress, load_balancer_hostname, zone_matches};
    use k8s_openapi::api::networking::v1::{
        Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
    };

    #[test]
    pub fn hub_ingress_terminates_tls_at_the_load_balancer() {
        let ingress = hub_ingress(&sample(), "arn:aws:acm:us-west-2:123456789012:certificate/abc");
        let annotations = ingress.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("kubernetes.io/ingress.class").map(String::as_str),
            Some("alb")
        );
        assert_eq!(
            annotations
                .get("alb.ingress.kubernetes.io/listen-ports")
                .map(String::as_str),
            Some(r#"[{"HTTPS":443}, {"HTTP":80}]"#)
        );
        assert_eq!(
            annotations
                .get("alb.ingress.kubernetes.io/certificate-arn")
                .map(String::as_str),
            Some("arn:aws:acm:us-west-2:123456789012:certificate/abc")
        );
    }

    #[test]
    pub fn hub_ingress_routes_root_to_the_proxy_service() {
        let ingress = hub_ingress(&sample(), "arn");
        let rules = ingress.spec.unwrap().rules.unwrap();
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
        let service = path.backend.service.as_ref().unwrap();
        assert_eq!(service.name, "proxy-public");
        assert_eq!(service.port.as_ref().unwrap().number, Some(80));
    }

    #[test]
    pub fn load_balancer_hostname_reads_the_first_status_entry() {
        let mut ingress = Ingress::default();
        assert_eq!(load_balancer_hostname(&ingress), None);
        ingress.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    hostname: Some(String::from("k8s-jhub-abc.us-west-2.elb.amazonaws.com")),
                    ..Default::default()
                }]),
            }),
        });
        assert_eq!(
            load_balancer_hostname(&ingress).as_deref(),
            Some("k8s-jhub-abc.us-west-2.elb.amazonaws.com")
        );
    }

    #[test]
    pub fn zone_matches_ignores_the_trailing_dot() {
        assert!(zone_matches("lab.opswerks.net.", "lab.opswerks.net"));
        assert!(zone_matches("lab.opswerks.net", "lab.opswerks.net"));
        assert!(!zone_matches("prod.opswerks.net.", "lab.opswerks.net"));
    }
}

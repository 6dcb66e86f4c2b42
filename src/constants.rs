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

pub(crate) const PROVISIONER_NAME: &str = "eks-lab-provisioner";

// Tenant identity federation
pub(crate) const STS_AUDIENCE: &str = "sts.amazonaws.com";
pub(crate) const ROLE_ARN_ANNOTATION_KEY: &str = "eks.amazonaws.com/role-arn";

// Kubeconfig document identifiers, kept stable for tooling that consumes it
pub(crate) const KUBECONFIG_CLUSTER: &str = "kubernetes";
pub(crate) const KUBECONFIG_CONTEXT: &str = "data-group";
pub(crate) const KUBECONFIG_USER: &str = "data-group-token-user";

// Lab image
pub(crate) const IMAGE_PLATFORM: &str = "linux/amd64";
pub(crate) const IMAGE_TAG: &str = "latest";
pub(crate) const PULL_SECRET_NAME: &str = "regcred";

// Hub ingress
pub(crate) const INGRESS_NAME: &str = "jupyterhub";
pub(crate) const HUB_PROXY_SERVICE: &str = "proxy-public";
pub(crate) const HUB_PROXY_PORT: i32 = 80;
pub(crate) const ALB_LISTEN_PORTS: &str = r#"[{"HTTPS":443}, {"HTTP":80}]"#;
pub(crate) const DNS_RECORD_TTL: i64 = 300;
pub(crate) const INGRESS_STATUS_RETRIES: i32 = 20;
pub(crate) const INGRESS_STATUS_INTERVAL_SECS: u64 = 15;

// Chart operations
pub(crate) const VALUES_PATH: &str = "values.yml";
pub(crate) const AUTOSCALER_CHART: &str = "cluster-autoscaler";
pub(crate) const AUTOSCALER_REPO: &str = "https://kubernetes.github.io/autoscaler";
pub(crate) const AUTOSCALER_NAMESPACE: &str = "kube-system";
pub(crate) const DEFAULT_REGION: &str = "us-west-2";

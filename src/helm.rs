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

use anyhow::Context;
use log::info;

use crate::config::Settings;
use crate::constants::{
    AUTOSCALER_CHART, AUTOSCALER_NAMESPACE, AUTOSCALER_REPO, VALUES_PATH,
};
use crate::utils;

/// The two-state operational switch: install the chart with the freshly
/// rendered values, or walk the uninstall as a dry run. There is no third
/// form; a malformed `deploy` value never reaches this point.
pub(crate) fn chart_args(settings: &Settings) -> Vec<String> {
    if settings.deploy {
        vec![
            String::from("upgrade"),
            String::from("--install"),
            String::from("-n"),
            settings.namespace.clone(),
            settings.chart_name.clone(),
            format!("{}/{}", settings.chart_name, settings.chart_name),
            String::from("-f"),
            format!("./{}", VALUES_PATH),
        ]
    } else {
        vec![
            String::from("uninstall"),
            String::from("-n"),
            settings.namespace.clone(),
            settings.chart_name.clone(),
            String::from("--dry-run"),
            String::from("--debug"),
        ]
    }
}

pub async fn run_chart_operation(settings: &Settings) -> anyhow::Result<()> {
    let args = chart_args(settings);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    utils::run_cli("helm", &args)
        .await
        .with_context(|| format!("helm {} failed", args[0]))?;
    info!(
        "helm {} completed for chart: {}",
        args[0], settings.chart_name
    );
    Ok(())
}

pub(crate) fn autoscaler_args(cluster_name: &str, region: &str) -> Vec<String> {
    vec![
        String::from("upgrade"),
        String::from("--install"),
        String::from(AUTOSCALER_CHART),
        String::from(AUTOSCALER_CHART),
        String::from("--repo"),
        String::from(AUTOSCALER_REPO),
        String::from("-n"),
        String::from(AUTOSCALER_NAMESPACE),
        String::from("--set"),
        String::from("cloudProvider=aws"),
        String::from("--set"),
        format!("awsRegion={}", region),
        String::from("--set"),
        String::from("autoDiscovery.enabled=true"),
        String::from("--set"),
        format!("autoDiscovery.clusterName={}", cluster_name),
        String::from("--set"),
        String::from("podLabels.app=cluster-autoscaler"),
    ]
}

/// Node autoscaling for the lab cluster, discovered by cluster name.
pub async fn ensure_cluster_autoscaler(settings: &Settings, region: &str) -> anyhow::Result<()> {
    let args = autoscaler_args(&settings.eks_cluster, region);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    utils::run_cli("helm", &args)
        .await
        .context("cluster-autoscaler install failed")?;
    info!("ensured cluster autoscaler in {}", AUTOSCALER_NAMESPACE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::tests::sample;
    use crate::helm::{autoscaler_args, chart_args};

    #[test]
    pub fn deploy_true_emits_the_install_form() {
        let args = chart_args(&sample());
        assert_eq!(
            args,
            vec![
                "upgrade",
                "--install",
                "-n",
                "jhub",
                "jupyterhub",
                "jupyterhub/jupyterhub",
                "-f",
                "./values.yml"
            ]
        );
    }

    #[test]
    pub fn deploy_false_emits_the_uninstall_dry_run_form() {
        let mut settings = sample();
        settings.deploy = false;
        let args = chart_args(&settings);
        assert_eq!(
            args,
            vec!["uninstall", "-n", "jhub", "jupyterhub", "--dry-run", "--debug"]
        );
    }

    #[test]
    pub fn autoscaler_discovers_the_cluster_by_name() {
        let args = autoscaler_args("academy-cluster", "us-west-2");
        assert!(args.contains(&String::from("autoDiscovery.clusterName=academy-cluster")));
        assert!(args.contains(&String::from("awsRegion=us-west-2")));
        assert!(args.contains(&String::from("--repo")));
    }
}

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

mod cluster;
mod config;
mod constants;
mod errors;
mod helm;
mod ingress;
mod provisioner;
mod rbac;
mod registry;
mod secrets;
mod tenants;
mod utils;
mod values;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let settings = config::Settings::load(&args.config)?;
    provisioner::run(settings)
        .await
        .with_context(|| "error occurred running the provisioner")?;

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct Args {
    #[arg(long, default_value = "lab-config.yaml")]
    pub(crate) config: String,
}

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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("credential error: {0:#}")]
    CredentialError(anyhow::Error),

    #[error("cluster lookup error: {0:#}")]
    ClusterLookupError(anyhow::Error),

    #[error("provisioning error: {0:#}")]
    ProvisionError(anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

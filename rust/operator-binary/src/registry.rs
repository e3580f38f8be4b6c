//! CRD registration at startup.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, PostParams},
    runtime::wait::{await_condition, conditions},
    Client, CustomResourceExt,
};
use mkube_crd::{Cluster, Zone};
use snafu::Snafu;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create CustomResourceDefinition {name:?}"))]
    CreateCrd { source: kube::Error, name: String },

    #[snafu(display("failed watching CustomResourceDefinition {name:?}"))]
    AwaitCrd {
        source: kube::runtime::wait::Error,
        name: String,
    },

    #[snafu(display("CustomResourceDefinition {name:?} was not established in time"))]
    CrdNotEstablished { name: String },
}

/// Registers the Zone and Cluster definitions and blocks until the API
/// server reports them established, so the controller's initial watches
/// cannot race the schema.
pub async fn ensure_crds(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in [Zone::crd(), Cluster::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match api.create(&PostParams::default(), &crd).await {
            Ok(_) => tracing::info!(crd = %name, "created CustomResourceDefinition"),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                tracing::debug!(crd = %name, "CustomResourceDefinition already registered");
            }
            Err(source) => return Err(Error::CreateCrd { source, name }),
        }

        let established = await_condition(api.clone(), &name, conditions::is_crd_established());
        match tokio::time::timeout(ESTABLISH_TIMEOUT, established).await {
            Ok(Ok(_)) => tracing::debug!(crd = %name, "CustomResourceDefinition established"),
            Ok(Err(source)) => return Err(Error::AwaitCrd { source, name }),
            Err(_) => return Err(Error::CrdNotEstablished { name }),
        }
    }
    Ok(())
}

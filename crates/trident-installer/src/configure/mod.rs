//! Post-install configuration of Trident through `tridentctl`

pub mod gcp;

use serde::Deserialize;

use trident_common::{Error, TRIDENT_CONTROLLER_CONTAINER};

use crate::client::PodExec;

/// Run `tridentctl` in the Trident controller container
pub(crate) async fn tridentctl(
    exec: &dyn PodExec,
    pod: &str,
    namespace: &str,
    args: &[&str],
) -> Result<Vec<u8>, Error> {
    let command: Vec<String> = std::iter::once("tridentctl")
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect();
    exec.exec(
        pod,
        Some(TRIDENT_CONTROLLER_CONTAINER.to_string()),
        namespace,
        &command,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct BackendList {
    #[serde(default)]
    items: Vec<BackendSummary>,
}

#[derive(Debug, Deserialize)]
struct BackendSummary {
    name: String,
}

/// Names of the backends Trident reports
pub(crate) async fn backend_names(
    exec: &dyn PodExec,
    pod: &str,
    namespace: &str,
) -> Result<Vec<String>, Error> {
    let output = tridentctl(exec, pod, namespace, &["get", "backends", "-o", "json"]).await?;
    parse_backend_names(&output)
}

fn parse_backend_names(output: &[u8]) -> Result<Vec<String>, Error> {
    let list: BackendList = serde_json::from_slice(output).map_err(|e| {
        Error::serialization_for_kind("backend", format!("invalid tridentctl backend list: {e}"))
    })?;
    Ok(list.items.into_iter().map(|b| b.name).collect())
}

//! Command execution inside pods
//!
//! Runs a command over the Kubernetes exec subprotocol and hands back stdout
//! followed by stderr as one buffer. Failures keep whatever output was
//! captured, with the error text appended, so callers can log the full
//! picture.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use trident_common::Error;

use crate::client::{KubeClusterClient, PodExec, PodPhase};

#[async_trait]
impl PodExec for KubeClusterClient {
    async fn exec(
        &self,
        pod: &str,
        container: Option<String>,
        namespace: &str,
        command: &[String],
    ) -> Result<Vec<u8>, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let target = pods.get(pod).await?;
        ensure_not_completed(&target)?;
        let container = select_container(&target, container)?;

        debug!(pod = %pod, namespace = %namespace, container = %container, command = ?command, "Executing command in pod");

        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| Error::exec(pod, format!("could not start command: {e}"), ""))?;

        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        let joined = attached.join().await;

        let failure = match (&stdout, &stderr) {
            (Err(e), _) | (_, Err(e)) => Some(format!("stream read failed: {e}")),
            _ => status_failure(status.as_ref()),
        }
        .or_else(|| joined.err().map(|e| format!("exec session failed: {e}")));

        let stdout = stdout.unwrap_or_default();
        let stderr = stderr.unwrap_or_default();

        match failure {
            None => Ok(combine_output(&stdout, &stderr, None)),
            Some(message) => {
                let output = combine_output(&stdout, &stderr, Some(&message));
                warn!(pod = %pod, error = %message, "Command in pod failed");
                Err(Error::exec(
                    pod,
                    message,
                    String::from_utf8_lossy(&output).into_owned(),
                ))
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Reject pods that finished; their containers can no longer run commands
fn ensure_not_completed(pod: &Pod) -> Result<(), Error> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some(p) if p == PodPhase::Succeeded.as_str() || p == PodPhase::Failed.as_str() => {
            Err(Error::exec(
                pod.metadata.name.as_deref().unwrap_or_default(),
                format!("cannot exec into a container in a completed pod; current phase is {p}"),
                "",
            ))
        }
        _ => Ok(()),
    }
}

/// Pick the container to run in: the requested one, or the only one
fn select_container(pod: &Pod, requested: Option<String>) -> Result<String, Error> {
    if let Some(name) = requested.filter(|n| !n.is_empty()) {
        return Ok(name);
    }
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    match containers {
        [only] => Ok(only.name.clone()),
        _ => Err(Error::validation(format!(
            "pod {} has {} containers; a container name is required",
            pod.metadata.name.as_deref().unwrap_or_default(),
            containers.len()
        ))),
    }
}

fn status_failure(status: Option<&Status>) -> Option<String> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return None;
    }
    Some(
        status
            .message
            .clone()
            .or_else(|| status.reason.clone())
            .unwrap_or_else(|| "command did not succeed".to_string()),
    )
}

fn combine_output(stdout: &[u8], stderr: &[u8], error: Option<&str>) -> Vec<u8> {
    let mut output = Vec::with_capacity(stdout.len() + stderr.len());
    output.extend_from_slice(stdout);
    output.extend_from_slice(stderr);
    if let Some(error) = error {
        if !output.is_empty() && !output.ends_with(b"\n") {
            output.push(b'\n');
        }
        output.extend_from_slice(error.as_bytes());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(containers: &[&str], phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("trident-controller-0".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn completed_pods_are_rejected() {
        assert!(ensure_not_completed(&pod(&["main"], "Running")).is_ok());
        assert!(ensure_not_completed(&pod(&["main"], "Pending")).is_ok());
        for phase in ["Succeeded", "Failed"] {
            let err = ensure_not_completed(&pod(&["main"], phase)).unwrap_err();
            assert!(err.to_string().contains(phase));
        }
    }

    #[test]
    fn container_is_inferred_only_for_single_container_pods() {
        let single = pod(&["trident-main"], "Running");
        assert_eq!(select_container(&single, None).unwrap(), "trident-main");

        let multi = pod(&["trident-main", "csi-provisioner"], "Running");
        assert!(matches!(
            select_container(&multi, None),
            Err(Error::Validation { .. })
        ));
        assert!(select_container(&multi, Some(String::new())).is_err());
        assert_eq!(
            select_container(&multi, Some("csi-provisioner".to_string())).unwrap(),
            "csi-provisioner"
        );
    }

    #[test]
    fn output_is_stdout_then_stderr_then_error() {
        assert_eq!(combine_output(b"out\n", b"err\n", None), b"out\nerr\n");
        assert_eq!(
            combine_output(b"out", b"", Some("exit code 1")),
            b"out\nexit code 1"
        );
        assert_eq!(combine_output(b"", b"", Some("boom")), b"boom");
    }

    #[test]
    fn non_success_status_is_a_failure() {
        let ok = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(status_failure(Some(&ok)), None);
        assert_eq!(status_failure(None), None);

        let failed = Status {
            status: Some("Failure".to_string()),
            message: Some("command terminated with non-zero exit code".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            ..Default::default()
        };
        assert_eq!(
            status_failure(Some(&failed)).as_deref(),
            Some("command terminated with non-zero exit code")
        );
    }
}

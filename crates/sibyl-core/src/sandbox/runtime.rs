//! The sandbox pod runtime contract.
//!
//! The production control plane talks to a Kubernetes-style pod API; the
//! core only depends on this trait. All operations are namespaced.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// Observed pod phase, mirroring the pod API's phase field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Minimal pod manifest the controller creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Container image for the runner container.
    pub image: String,
    /// Container command; sandboxes idle with `sleep infinity`.
    pub command: Vec<String>,
}

/// Pod API surface the sandbox controller requires.
#[async_trait]
pub trait PodRuntime: Send + Sync {
    /// Create a pod from the manifest. Creating an existing pod is an
    /// error; callers check existence first.
    async fn create_pod(&self, namespace: &str, spec: &PodSpec) -> Result<()>;

    /// Read a pod's phase. `None` when the pod does not exist.
    async fn get_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>>;

    /// Delete a pod. Deleting a missing pod is a no-op.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Read the trailing `tail_lines` of the pod's logs.
    async fn pod_logs(&self, namespace: &str, name: &str, tail_lines: u32) -> Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PodRuntime) {}
};

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct MemoryPod {
    spec: PodSpec,
    phase: PodPhase,
    logs: Vec<String>,
}

/// In-process [`PodRuntime`] used by tests and embedded deployments.
///
/// Created pods start `Running`; tests can force phases with
/// [`MemoryPodRuntime::set_phase`] to exercise the reconcile loop.
#[derive(Default)]
pub struct MemoryPodRuntime {
    pods: Mutex<HashMap<(String, String), MemoryPod>>,
}

impl MemoryPodRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a pod's phase (test hook standing in for cluster events).
    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let mut pods = self.pods.lock().expect("pod lock poisoned");
        if let Some(pod) = pods.get_mut(&(namespace.to_owned(), name.to_owned())) {
            pod.phase = phase;
        }
    }

    /// Append a log line to a pod (test hook).
    pub fn push_log(&self, namespace: &str, name: &str, line: &str) {
        let mut pods = self.pods.lock().expect("pod lock poisoned");
        if let Some(pod) = pods.get_mut(&(namespace.to_owned(), name.to_owned())) {
            pod.logs.push(line.to_owned());
        }
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().expect("pod lock poisoned").len()
    }
}

#[async_trait]
impl PodRuntime for MemoryPodRuntime {
    async fn create_pod(&self, namespace: &str, spec: &PodSpec) -> Result<()> {
        let mut pods = self.pods.lock().expect("pod lock poisoned");
        let key = (namespace.to_owned(), spec.name.clone());
        if pods.contains_key(&key) {
            bail!("pod {} already exists in namespace {namespace}", spec.name);
        }
        pods.insert(
            key,
            MemoryPod {
                spec: spec.clone(),
                phase: PodPhase::Running,
                logs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>> {
        let pods = self.pods.lock().expect("pod lock poisoned");
        Ok(pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|pod| pod.phase))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut pods = self.pods.lock().expect("pod lock poisoned");
        pods.remove(&(namespace.to_owned(), name.to_owned()));
        Ok(())
    }

    async fn pod_logs(&self, namespace: &str, name: &str, tail_lines: u32) -> Result<String> {
        let pods = self.pods.lock().expect("pod lock poisoned");
        let Some(pod) = pods.get(&(namespace.to_owned(), name.to_owned())) else {
            bail!("pod {name} not found in namespace {namespace}");
        };
        let start = pod.logs.len().saturating_sub(tail_lines as usize);
        Ok(pod.logs[start..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> PodSpec {
        PodSpec {
            name: name.to_owned(),
            labels: BTreeMap::new(),
            image: "busybox:1.36".to_owned(),
            command: vec!["sh".to_owned(), "-c".to_owned(), "sleep infinity".to_owned()],
        }
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let runtime = MemoryPodRuntime::new();
        runtime.create_pod("default", &spec("p1")).await.unwrap();
        assert_eq!(
            runtime.get_pod_phase("default", "p1").await.unwrap(),
            Some(PodPhase::Running)
        );

        // Duplicate create errors.
        assert!(runtime.create_pod("default", &spec("p1")).await.is_err());

        runtime.delete_pod("default", "p1").await.unwrap();
        assert_eq!(runtime.get_pod_phase("default", "p1").await.unwrap(), None);
        // Deleting again is a no-op.
        runtime.delete_pod("default", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn logs_tail() {
        let runtime = MemoryPodRuntime::new();
        runtime.create_pod("default", &spec("p1")).await.unwrap();
        for i in 0..5 {
            runtime.push_log("default", "p1", &format!("line {i}"));
        }
        let tail = runtime.pod_logs("default", "p1", 2).await.unwrap();
        assert_eq!(tail, "line 3\nline 4");

        assert!(runtime.pod_logs("default", "ghost", 10).await.is_err());
    }
}

//! At-most-one-task bookkeeping (§4.4): before doing anything else, a
//! reconciliation resolves `status.task_ref` into one of three outcomes, and
//! only a handler that produces `NoTask` may ever call into the hypervisor
//! to start a new one.

use crate::crd::TaskRefStatus;

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use proxmox_client::client::ProxmoxClient;
use proxmox_client::task::{self, TaskOutcome};
use proxmox_client::types::TaskRef;
use proxmox_operator::error::{Error, Result};

/// Retry-after cooldown recorded on a task failure (§4.4).
pub const TASK_FAILURE_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq)]
pub enum TaskPoll {
    /// No task recorded; the handler may issue one.
    NoTask,
    /// Still in flight; requeue without mutating status.
    Pending,
    /// Completed successfully; the caller clears `task_ref` and advances.
    Succeeded,
    /// Completed with a failure; the caller records `TaskFailure` and sets a
    /// fresh retry-after.
    Failed,
}

/// Resolve the current task, per §4.4: a still-future retry-after returns a
/// typed requeue without polling the hypervisor at all; an expired one
/// clears itself so the handler can reissue.
pub async fn poll(client: &dyn ProxmoxClient, task_ref: Option<&TaskRefStatus>, now: DateTime<Utc>) -> Result<TaskPoll> {
    let Some(task_ref) = task_ref else {
        return Ok(TaskPoll::NoTask);
    };

    if let Some(retry_after) = &task_ref.retry_after {
        match remaining(retry_after, now) {
            Some(remaining) => return Err(Error::RequeueAfter(remaining)),
            None => return Ok(TaskPoll::NoTask),
        }
    }

    let outcome = client
        .get_task(&TaskRef {
            node: task_ref.node.clone(),
            upid: task_ref.upid.clone(),
        })
        .await
        .map(task::classify)?;

    Ok(match outcome {
        TaskOutcome::Pending => TaskPoll::Pending,
        TaskOutcome::Success => TaskPoll::Succeeded,
        TaskOutcome::Failed => TaskPoll::Failed,
    })
}

/// Remaining time until `retry_after`, or `None` if it has already passed.
fn remaining(retry_after: &Time, now: DateTime<Utc>) -> Option<Duration> {
    let delta = retry_after.0 - now;
    delta.to_std().ok()
}

#[must_use]
pub fn failed_task_ref(node: &str, now: DateTime<Utc>) -> TaskRefStatus {
    TaskRefStatus {
        node: node.to_string(),
        upid: String::new(),
        retry_after: Some(Time(now + chrono::Duration::from_std(TASK_FAILURE_RETRY_AFTER).unwrap())),
    }
}

#[must_use]
pub fn in_flight_task_ref(task: &TaskRef) -> TaskRefStatus {
    TaskRefStatus {
        node: task.node.clone(),
        upid: task.upid.clone(),
        retry_after: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proxmox_client::mock::MockProxmoxClient;

    #[tokio::test]
    async fn absent_task_ref_allows_issuing_a_new_task() {
        let client = MockProxmoxClient::new();
        let outcome = poll(&client, None, Utc::now()).await.unwrap();
        assert_eq!(outcome, TaskPoll::NoTask);
    }

    #[tokio::test]
    async fn future_retry_after_requeues_without_polling_the_hypervisor() {
        let client = MockProxmoxClient::new();
        let now = Utc::now();
        let task_ref = failed_task_ref("pve1", now);
        let err = poll(&client, Some(&task_ref), now).await.unwrap_err();
        assert!(matches!(err, Error::RequeueAfter(_)));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn expired_retry_after_clears_itself() {
        let client = MockProxmoxClient::new();
        let past = Utc::now() - chrono::Duration::seconds(120);
        let task_ref = failed_task_ref("pve1", past);
        let outcome = poll(&client, Some(&task_ref), Utc::now()).await.unwrap();
        assert_eq!(outcome, TaskPoll::NoTask);
    }

    #[tokio::test]
    async fn in_flight_task_polls_the_hypervisor() {
        let client = MockProxmoxClient::new();
        client.set_task_state("UPID:pve1:abc", proxmox_client::types::TaskState::Running);
        let task_ref = in_flight_task_ref(&TaskRef {
            node: "pve1".into(),
            upid: "UPID:pve1:abc".into(),
        });
        let outcome = poll(&client, Some(&task_ref), Utc::now()).await.unwrap();
        assert_eq!(outcome, TaskPoll::Pending);
    }
}

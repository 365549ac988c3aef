//! Dependency resolution: readiness checks and cancellation cascades.

use std::collections::HashMap;

use super::dependency::DependencyGraph;
use crate::domain::{CancelCause, TaskId, TaskRecord, TaskStatus};

/// Where a pending task stands with respect to its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency completed.
    Ready,

    /// Some dependencies are still pending, running, or failed with retries left.
    Waiting { on: Vec<TaskId> },

    /// A dependency can never complete.
    Blocked { cause: CancelCause },
}

/// Snapshot of dependency statuses: `(status, terminal)` per id.
pub type StatusSnapshot = HashMap<TaskId, (TaskStatus, bool)>;

pub struct DependencyResolver;

impl DependencyResolver {
    /// True iff the task has no dependencies or every one is completed.
    pub fn is_ready(task: &TaskRecord, statuses: &StatusSnapshot) -> bool {
        task.dependencies.iter().all(|dep| {
            statuses
                .get(dep)
                .is_some_and(|(status, _)| *status == TaskStatus::Completed)
        })
    }

    pub fn readiness(task: &TaskRecord, statuses: &StatusSnapshot) -> Readiness {
        let mut waiting = Vec::new();
        for &dep in &task.dependencies {
            match statuses.get(&dep) {
                Some((TaskStatus::Completed, _)) => {}
                Some((TaskStatus::Cancelled, _)) => {
                    return Readiness::Blocked {
                        cause: CancelCause::DependencyCancelled { dependency: dep },
                    };
                }
                Some((TaskStatus::Failed, true)) => {
                    return Readiness::Blocked {
                        cause: CancelCause::DependencyFailed { dependency: dep },
                    };
                }
                Some(_) | None => waiting.push(dep),
            }
        }
        if waiting.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Waiting { on: waiting }
        }
    }

    /// Tasks to cancel after `origin` became terminal failed or cancelled.
    ///
    /// Direct dependents are attributed to `origin`; deeper ones to the
    /// dependency through which the cancellation reached them. Only tasks that
    /// are still pending are returned.
    pub fn cascade(
        origin: &TaskRecord,
        graph: &DependencyGraph,
        records: &HashMap<TaskId, TaskRecord>,
    ) -> Vec<(TaskId, CancelCause)> {
        let first_cause = |dependency| match origin.status {
            TaskStatus::Failed => CancelCause::DependencyFailed { dependency },
            _ => CancelCause::DependencyCancelled { dependency },
        };

        let mut plan: Vec<(TaskId, CancelCause)> = Vec::new();
        let mut frontier = vec![origin.id];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for parent in frontier {
                for child in graph.get_waiting_tasks(parent) {
                    let pending = records
                        .get(&child)
                        .is_some_and(|r| r.status == TaskStatus::Pending);
                    if !pending || plan.iter().any(|(id, _)| *id == child) {
                        continue;
                    }
                    let cause = if parent == origin.id {
                        first_cause(parent)
                    } else {
                        CancelCause::DependencyCancelled { dependency: parent }
                    };
                    plan.push((child, cause));
                    next.push(child);
                }
            }
            frontier = next;
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, StatusUpdate};
    use chrono::Utc;
    use ulid::Ulid;

    fn id(n: u64) -> TaskId {
        TaskId::from_ulid(Ulid::from_parts(n, 0))
    }

    fn task(n: u64, deps: &[u64]) -> TaskRecord {
        let mut draft = NewTask::new("job").with_id(id(n));
        for d in deps {
            draft = draft.depends_on(id(*d));
        }
        TaskRecord::new(n, draft, Utc::now())
    }

    #[test]
    fn ready_only_when_all_dependencies_completed() {
        let t = task(3, &[1, 2]);
        let mut statuses = StatusSnapshot::new();
        statuses.insert(id(1), (TaskStatus::Completed, true));
        statuses.insert(id(2), (TaskStatus::Running, false));

        assert!(!DependencyResolver::is_ready(&t, &statuses));
        assert_eq!(
            DependencyResolver::readiness(&t, &statuses),
            Readiness::Waiting { on: vec![id(2)] }
        );

        statuses.insert(id(2), (TaskStatus::Completed, true));
        assert!(DependencyResolver::is_ready(&t, &statuses));
        assert!(DependencyResolver::is_ready(&task(4, &[]), &StatusSnapshot::new()));
    }

    #[test]
    fn retryable_failure_still_waits() {
        let t = task(2, &[1]);
        let mut statuses = StatusSnapshot::new();
        statuses.insert(id(1), (TaskStatus::Failed, false));
        assert!(matches!(
            DependencyResolver::readiness(&t, &statuses),
            Readiness::Waiting { .. }
        ));

        statuses.insert(id(1), (TaskStatus::Failed, true));
        assert_eq!(
            DependencyResolver::readiness(&t, &statuses),
            Readiness::Blocked {
                cause: CancelCause::DependencyFailed { dependency: id(1) }
            }
        );
    }

    #[test]
    fn cascade_attributes_causes_by_parent() {
        // 1 <- 2 <- 3, and 4 depends on 1 but already completed.
        let mut origin = task(1, &[]);
        let now = Utc::now();
        origin.apply(StatusUpdate::Start, now).unwrap();
        origin
            .apply(
                StatusUpdate::Fail {
                    error: "boom".into(),
                    terminal: true,
                },
                now,
            )
            .unwrap();

        let mut done = task(4, &[1]);
        done.status = TaskStatus::Completed;

        let records: HashMap<_, _> = [origin.clone(), task(2, &[1]), task(3, &[2]), done]
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let mut graph = DependencyGraph::new();
        for r in records.values() {
            for d in &r.dependencies {
                graph.add_dependency(r.id, *d);
            }
        }

        let plan = DependencyResolver::cascade(&origin, &graph, &records);
        assert_eq!(
            plan,
            vec![
                (id(2), CancelCause::DependencyFailed { dependency: id(1) }),
                (id(3), CancelCause::DependencyCancelled { dependency: id(2) }),
            ]
        );
    }
}

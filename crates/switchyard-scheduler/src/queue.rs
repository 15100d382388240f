//! Priority task queue
//!
//! Ordered by priority descending, then submission time ascending so equal
//! priorities dequeue first-in first-out.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::task::Task;

struct QueuedTask {
    priority: i64,
    submitted_at: DateTime<Utc>,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.heap.push(QueuedTask {
            priority: task.priority,
            submitted_at: task.submitted_at,
            task,
        });
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|q| q.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove a queued task by id. Rebuilds the heap; cancellation is rare.
    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        let mut removed = None;
        let drained: Vec<QueuedTask> = self.heap.drain().collect();
        for entry in drained {
            if removed.is_none() && entry.task.id == task_id {
                removed = Some(entry.task);
            } else {
                self.heap.push(entry);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;

    fn task(name: &str, priority: i64) -> Task {
        Task::from_spec(TaskSpec::new(name, json!({})).with_priority(priority))
    }

    #[test]
    fn test_higher_priority_first() {
        let mut q = TaskQueue::new();
        q.push(task("low", 1));
        q.push(task("high", 9));
        q.push(task("mid", 5));
        assert_eq!(q.pop().unwrap().name, "high");
        assert_eq!(q.pop().unwrap().name, "mid");
        assert_eq!(q.pop().unwrap().name, "low");
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let mut q = TaskQueue::new();
        let mut first = task("first", 3);
        let mut second = task("second", 3);
        // Force distinct submission times
        first.submitted_at = Utc::now() - chrono::Duration::milliseconds(10);
        second.submitted_at = Utc::now();
        q.push(second);
        q.push(first);
        assert_eq!(q.pop().unwrap().name, "first");
        assert_eq!(q.pop().unwrap().name, "second");
    }

    #[test]
    fn test_remove_by_id() {
        let mut q = TaskQueue::new();
        let t = task("target", 2);
        let id = t.id.clone();
        q.push(task("other", 1));
        q.push(t);
        let removed = q.remove(&id).unwrap();
        assert_eq!(removed.name, "target");
        assert_eq!(q.len(), 1);
        assert!(q.remove(&id).is_none());
    }

    #[test]
    fn test_empty_pop() {
        let mut q = TaskQueue::new();
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}

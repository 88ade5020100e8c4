use std::collections::{HashMap, VecDeque};

use tokio::sync::watch;

use super::super::fetcher::StopSignal;
use super::super::task::{DownloadTask, TaskId, TaskState};
use super::EngineStatistics;

/// Handle on a running driver.
pub(super) struct RunControl {
    pub(super) stop: watch::Sender<StopSignal>,
    pub(super) finished: watch::Receiver<bool>,
}

impl RunControl {
    /// Raises `signal` unless a stronger one is already pending.
    ///
    /// Cancel overrides Pause; Shutdown overrides both.
    pub(super) fn request(&self, signal: StopSignal) {
        self.stop.send_if_modified(|current| {
            let rank = |s: StopSignal| match s {
                StopSignal::Run => 0,
                StopSignal::Pause => 1,
                StopSignal::Cancel => 2,
                StopSignal::Shutdown => 3,
            };
            if rank(signal) > rank(*current) {
                *current = signal;
                true
            } else {
                false
            }
        });
    }
}

pub(super) struct TaskSlot {
    /// Latest snapshot; the driver owns the live copy while running.
    pub(super) task: DownloadTask,
    pub(super) control: Option<RunControl>,
    pub(super) queued: bool,
}

impl TaskSlot {
    pub(super) fn is_busy(&self) -> bool {
        self.control.is_some() || self.queued
    }
}

/// Task registry, FIFO admission queue and active counter, under one lock.
pub(super) struct Registry {
    pub(super) slots: HashMap<TaskId, TaskSlot>,
    queue: VecDeque<TaskId>,
    pub(super) active: usize,
    pub(super) max_active: usize,
    pub(super) shutting_down: bool,
}

impl Registry {
    pub(super) fn new(max_active: usize) -> Self {
        Self {
            slots: HashMap::new(),
            queue: VecDeque::new(),
            active: 0,
            max_active,
            shutting_down: false,
        }
    }

    pub(super) fn insert(&mut self, task: DownloadTask) {
        self.slots.insert(
            task.id,
            TaskSlot {
                task,
                control: None,
                queued: false,
            },
        );
    }

    /// Appends a task to the admission queue; false if unknown or already busy.
    pub(super) fn enqueue(&mut self, id: TaskId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if !slot.is_busy() => {
                slot.queued = true;
                self.queue.push_back(id);
                true
            }
            _ => false,
        }
    }

    pub(super) fn dequeue(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.queued = false;
        }
        self.queue.retain(|queued| *queued != id);
    }

    pub(super) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True when a newly queued task would be admitted right away.
    pub(super) fn has_free_slot(&self) -> bool {
        self.active + self.queue.len() <= self.max_active
    }

    /// Pops the next task to admit, if a concurrency slot is free.
    pub(super) fn next_admission(&mut self) -> Option<TaskId> {
        if self.shutting_down || self.active >= self.max_active {
            return None;
        }
        while let Some(id) = self.queue.pop_front() {
            if let Some(slot) = self.slots.get_mut(&id)
                && slot.queued
            {
                slot.queued = false;
                return Some(id);
            }
        }
        None
    }

    pub(super) fn clear_queue(&mut self) {
        for id in self.queue.drain(..) {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.queued = false;
            }
        }
    }

    /// Destination already claimed by another unfinished task.
    pub(super) fn destination_owner(&self, destination: &std::path::Path) -> Option<TaskId> {
        self.slots
            .values()
            .find(|slot| {
                slot.task.destination == destination
                    && !matches!(slot.task.state, TaskState::Canceled | TaskState::Completed)
            })
            .map(|slot| slot.task.id)
    }

    pub(super) fn statistics(&self) -> EngineStatistics {
        let mut stats = EngineStatistics {
            total: self.slots.len(),
            active: self.active,
            queued: self.queue.len(),
            ..EngineStatistics::default()
        };
        for slot in self.slots.values() {
            *stats.by_state.entry(slot.task.state).or_insert(0) += 1;
            stats.bytes_downloaded += slot.task.bytes_downloaded();
        }
        stats
    }
}

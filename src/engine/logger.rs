use std::collections::HashSet;
use std::fmt;

use tracing::{Level, debug, info};

use crate::key::TaskKey;

/// How the value at a task key was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    AccessedFromMemory,
    AccessedFromDefinition,
    LoadedFromDisk,
    Computing,
    Computed,
}

impl TaskEvent {
    /// Whether this event settles how the key was derived. Only the start of
    /// a computation does not.
    fn resolves(self) -> bool {
        !matches!(self, TaskEvent::Computing)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskLogRecord {
    pub task_key: TaskKey,
    pub event: TaskEvent,
    pub level: Level,
}

impl fmt::Display for TaskLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = &self.task_key;
        match self.event {
            TaskEvent::AccessedFromMemory => write!(f, "Accessed   {key} from in-memory cache"),
            TaskEvent::AccessedFromDefinition => write!(f, "Accessed   {key} from definition"),
            TaskEvent::LoadedFromDisk => write!(f, "Loaded     {key} from disk cache"),
            TaskEvent::Computing => write!(f, "Computing  {key} ..."),
            TaskEvent::Computed => write!(f, "Computed   {key}"),
        }
    }
}

/// Reports how each task key used by one derivation was obtained, once per
/// key. A computation is the exception: it is reported when it starts and
/// again when it finishes.
pub(crate) struct TaskKeyLogger<'a> {
    level: Level,
    logged: HashSet<TaskKey>,
    journal: &'a mut Vec<TaskLogRecord>,
}

impl<'a> TaskKeyLogger<'a> {
    pub fn new(level: Level, journal: &'a mut Vec<TaskLogRecord>) -> Self {
        Self {
            level,
            logged: HashSet::new(),
            journal,
        }
    }

    fn log(&mut self, event: TaskEvent, task_key: &TaskKey) {
        if self.logged.contains(task_key) {
            return;
        }

        let record = TaskLogRecord {
            task_key: task_key.clone(),
            event,
            level: self.level,
        };

        if self.level == Level::DEBUG {
            debug!("{record}");
        } else {
            info!("{record}");
        }

        if event.resolves() {
            self.logged.insert(task_key.clone());
        }
        self.journal.push(record);
    }

    pub fn accessed_from_memory(&mut self, task_key: &TaskKey) {
        self.log(TaskEvent::AccessedFromMemory, task_key);
    }

    pub fn accessed_from_definition(&mut self, task_key: &TaskKey) {
        self.log(TaskEvent::AccessedFromDefinition, task_key);
    }

    pub fn loaded_from_disk(&mut self, task_key: &TaskKey) {
        self.log(TaskEvent::LoadedFromDisk, task_key);
    }

    pub fn computing(&mut self, task_key: &TaskKey) {
        self.log(TaskEvent::Computing, task_key);
    }

    pub fn computed(&mut self, task_key: &TaskKey) {
        self.log(TaskEvent::Computed, task_key);
    }
}

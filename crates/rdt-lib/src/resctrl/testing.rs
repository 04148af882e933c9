//! In-memory updater used by unit tests

use super::error::{ResctrlError, Result};
use super::updater::ResctrlUpdater;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    groups: HashMap<String, String>,
    tasks: HashMap<String, Vec<i32>>,
    creates: usize,
    schemata_writes: usize,
    removes: usize,
    fail_creates: bool,
    fail_removes: bool,
}

/// Simulates the set of kernel group directories
#[derive(Default)]
pub struct MockUpdater {
    state: Mutex<State>,
}

impl MockUpdater {
    pub fn insert_group(&self, group: &str) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(group.to_string(), String::new());
    }

    pub fn set_tasks(&self, group: &str, tasks: Vec<i32>) {
        self.state.lock().unwrap().tasks.insert(group.to_string(), tasks);
    }

    pub fn tasks_of(&self, group: &str) -> Vec<i32> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.state.lock().unwrap().groups.contains_key(group)
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    pub fn schemata_of(&self, group: &str) -> Option<String> {
        self.state.lock().unwrap().groups.get(group).cloned()
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn schemata_writes(&self) -> usize {
        self.state.lock().unwrap().schemata_writes
    }

    pub fn removes(&self) -> usize {
        self.state.lock().unwrap().removes
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    pub fn fail_removes(&self, fail: bool) {
        self.state.lock().unwrap().fail_removes = fail;
    }
}

fn denied(group: &str) -> ResctrlError {
    ResctrlError::io(
        group,
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
    )
}

#[async_trait]
impl ResctrlUpdater for MockUpdater {
    async fn create_group(&self, group: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_creates {
            return Err(denied(group));
        }
        state.creates += 1;
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn write_schemata(&self, group: &str, schemata: &str) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.groups.get_mut(group) {
            Some(current) => {
                *current = schemata.to_string();
                state.schemata_writes += 1;
                Ok(())
            }
            None => Err(ResctrlError::io(
                group,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )),
        }
    }

    async fn remove_group(&self, group: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_removes {
            return Err(denied(group));
        }
        state.removes += 1;
        state.groups.remove(group);
        state.tasks.remove(group);
        Ok(())
    }

    async fn read_tasks(&self, group: &str) -> Result<Vec<i32>> {
        Ok(self.tasks_of(group))
    }

    async fn write_tasks(&self, group: &str, tasks: &[i32]) -> Result<Vec<i32>> {
        let mut state = self.state.lock().unwrap();
        state
            .tasks
            .entry(group.to_string())
            .or_default()
            .extend_from_slice(tasks);
        Ok(tasks.to_vec())
    }
}

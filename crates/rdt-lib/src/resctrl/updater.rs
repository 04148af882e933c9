//! Kernel side effects on the resource-control filesystem
//!
//! The control group store never touches the filesystem directly; every
//! mutation goes through a [`ResctrlUpdater`] so hosts (and tests) can
//! supply their own implementation.

use super::error::{ResctrlError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

const SCHEMATA_FILE: &str = "schemata";
const TASKS_FILE: &str = "tasks";

/// Returned by the kernel when a task exited before it could be moved
const ESRCH: i32 = 3;

/// Side effects applied to resctrl groups
#[async_trait]
pub trait ResctrlUpdater: Send + Sync {
    /// Create the group directory; an existing directory is success
    async fn create_group(&self, group: &str) -> Result<()>;

    /// Write the rendered schema text into the group's schemata file
    async fn write_schemata(&self, group: &str, schemata: &str) -> Result<()>;

    /// Remove the group directory; a missing directory is success
    async fn remove_group(&self, group: &str) -> Result<()>;

    /// Task ids currently assigned to the group
    async fn read_tasks(&self, group: &str) -> Result<Vec<i32>>;

    /// Move tasks into the group, returning the ids actually moved
    async fn write_tasks(&self, group: &str, tasks: &[i32]) -> Result<Vec<i32>>;
}

/// Updater backed by the real resctrl mount
#[derive(Debug, Clone)]
pub struct FsResctrlUpdater {
    root: PathBuf,
}

impl FsResctrlUpdater {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.root.join(group)
    }
}

#[async_trait]
impl ResctrlUpdater for FsResctrlUpdater {
    async fn create_group(&self, group: &str) -> Result<()> {
        let path = self.group_path(group);
        match fs::create_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(group = %group, "Resctrl group already exists");
                Ok(())
            }
            Err(e) => Err(ResctrlError::io(path, e)),
        }
    }

    async fn write_schemata(&self, group: &str, schemata: &str) -> Result<()> {
        let path = self.group_path(group).join(SCHEMATA_FILE);
        fs::write(&path, schemata)
            .await
            .map_err(|e| ResctrlError::io(path, e))
    }

    async fn remove_group(&self, group: &str) -> Result<()> {
        let path = self.group_path(group);
        match fs::remove_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(group = %group, "Resctrl group already removed");
                Ok(())
            }
            Err(e) => Err(ResctrlError::io(path, e)),
        }
    }

    async fn read_tasks(&self, group: &str) -> Result<Vec<i32>> {
        let path = self.group_path(group).join(TASKS_FILE);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ResctrlError::io(&path, e))?;

        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    async fn write_tasks(&self, group: &str, tasks: &[i32]) -> Result<Vec<i32>> {
        let path = self.group_path(group).join(TASKS_FILE);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ResctrlError::io(&path, e))?;

        write_task_ids(&mut file, group, tasks)
            .await
            .map_err(|e| ResctrlError::io(&path, e))
    }
}

/// Write task ids one per write, skipping tasks that already exited
///
/// Every id is flushed before the next is written so a kernel rejection
/// is attributed to the id that caused it.
async fn write_task_ids<W>(writer: &mut W, group: &str, tasks: &[i32]) -> std::io::Result<Vec<i32>>
where
    W: AsyncWrite + Unpin,
{
    let mut moved = Vec::with_capacity(tasks.len());
    for task in tasks {
        let line = format!("{}\n", task);
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => moved.push(*task),
            Err(e) if e.raw_os_error() == Some(ESRCH) => {
                debug!(group = %group, task, "Task exited before assignment");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(moved)
}

//! Mirror of the server's view of each tracked file.
//!
//! The editor reports buffer events; the state machine decides which
//! `textDocument/did*` notification (if any) the caller must send, and keeps
//! the version counter exactly in step with what the server has seen.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

type Checksum = [u8; 20];

fn checksum(contents: &[u8]) -> Checksum {
    Sha1::digest(contents).into()
}

/// Whether the server currently has the file open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Closed,
}

/// The notification the caller must send for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    OpenFile,
    ChangeFile,
    CloseFile,
    NoAction,
}

/// Server-visible state of one tracked file.
#[derive(Debug)]
pub struct ServerFileState {
    version: i32,
    state: FileState,
    checksum: Option<Checksum>,
    contents: Vec<u8>,
}

impl Default for ServerFileState {
    fn default() -> Self {
        Self {
            version: 0,
            state: FileState::Closed,
            checksum: None,
            contents: Vec::new(),
        }
    }
}

impl ServerFileState {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn state(&self) -> FileState {
        self.state
    }

    /// Last contents sent to the server.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The editor holds a dirty buffer with `contents`.
    pub fn dirty_file(&mut self, contents: &[u8]) -> FileAction {
        let new_checksum = checksum(contents);
        match self.state {
            FileState::Closed => {
                // The only version reset in the lifecycle: a re-open starts
                // the server-visible version over at 1.
                self.version = 0;
                self.record_sent(contents, new_checksum);
                FileAction::OpenFile
            }
            FileState::Open if self.checksum == Some(new_checksum) => FileAction::NoAction,
            FileState::Open => {
                self.record_sent(contents, new_checksum);
                FileAction::ChangeFile
            }
        }
    }

    /// The file was saved on disk with `contents`.
    ///
    /// A save of a file the server has closed is a no-op; a save that
    /// matches the last-sent contents is a no-op; otherwise the new contents
    /// go to the server as a change.
    pub fn saved_file(&mut self, contents: &[u8]) -> FileAction {
        match self.state {
            FileState::Closed => FileAction::NoAction,
            FileState::Open => {
                let new_checksum = checksum(contents);
                if self.checksum == Some(new_checksum) {
                    FileAction::NoAction
                } else {
                    self.record_sent(contents, new_checksum);
                    FileAction::ChangeFile
                }
            }
        }
    }

    /// The editor closed the file.
    ///
    /// Version and checksum survive the close so a later re-open can be
    /// deduplicated against the last-sent contents after the reset.
    pub fn file_close(&mut self) -> FileAction {
        match self.state {
            FileState::Open => {
                self.state = FileState::Closed;
                FileAction::CloseFile
            }
            FileState::Closed => FileAction::NoAction,
        }
    }

    fn record_sent(&mut self, contents: &[u8], new_checksum: Checksum) {
        self.version += 1;
        self.state = FileState::Open;
        self.checksum = Some(new_checksum);
        self.contents = contents.to_vec();
    }
}

/// All tracked files, keyed by absolute path.
#[derive(Debug, Default)]
pub struct ServerFileStateStore {
    files: HashMap<PathBuf, ServerFileState>,
}

impl ServerFileStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a file's state, creating a fresh `Closed` entry if absent.
    pub fn get_or_insert(&mut self, path: &Path) -> &mut ServerFileState {
        self.files.entry(path.to_path_buf()).or_default()
    }

    pub fn get(&self, path: &Path) -> Option<&ServerFileState> {
        self.files.get(path)
    }

    /// Drop a file's state entirely (file purged from the workspace).
    pub fn remove(&mut self, path: &Path) -> Option<ServerFileState> {
        self.files.remove(path)
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

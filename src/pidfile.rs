/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! PID directory selection and PID file reading.
//!
//! The supervisor stores per-watch PID files in a single directory, chosen
//! at startup by probing a fixed list of candidates and taking the first
//! one that can be created.  Reading a watch's PID file back is how the
//! `unmonitored` transition discovers a child that survived a supervisor
//! restart.

use crate::fs;
use anyhow::{bail, Result};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use tracing::{event, Level};

/// Chooses the PID directory: the first candidate of `/var/run/nyx`,
/// `~/.nyx/pid`, `/tmp/nyx/pid` that can be created.
pub fn select_pid_dir() -> Result<PathBuf> {
    match select_from(&candidate_dirs()) {
        Some(dir) => Ok(dir),
        None => bail!("unable to create a PID directory"),
    }
}

fn candidate_dirs() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/var/run/nyx")];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".nyx/pid"));
    }
    candidates.push(PathBuf::from("/tmp/nyx/pid"));
    candidates
}

fn select_from(candidates: &[PathBuf]) -> Option<PathBuf> {
    for dir in candidates {
        if fs::mkdir_p(dir) {
            event!(Level::DEBUG, "Using PID directory '{}'", dir.display());
            return Some(dir.clone());
        }
    }
    None
}

/// Reads the PID recorded for watch `name`, if any.  Absent, unreadable or
/// unparsable files all mean "no candidate".
pub fn determine_pid(pid_dir: &Path, name: &str) -> Option<libc::pid_t> {
    let contents = read_to_string(pid_dir.join(name)).ok()?;
    contents
        .trim()
        .parse::<libc::pid_t>()
        .ok()
        .filter(|&pid| pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_creatable_candidate_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("blocker");
        std::fs::write(&blocked, b"x").unwrap();
        let first = blocked.join("pid"); // below a plain file, cannot exist
        let second = tmp.path().join("pid");

        let chosen = select_from(&[first, second.clone()]).unwrap();
        assert_eq!(chosen, second);
        assert!(second.is_dir());
    }

    #[test]
    fn no_creatable_candidate_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("blocker");
        std::fs::write(&blocked, b"x").unwrap();
        assert_eq!(select_from(&[blocked.join("pid")]), None);
    }

    #[test]
    fn determine_pid_reads_a_trimmed_pid() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("w"), b" 1234\n").unwrap();
        assert_eq!(determine_pid(tmp.path(), "w"), Some(1234));
    }

    #[test]
    fn determine_pid_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("junk"), b"not-a-pid").unwrap();
        std::fs::write(tmp.path().join("zero"), b"0").unwrap();
        std::fs::write(tmp.path().join("negative"), b"-5").unwrap();
        assert_eq!(determine_pid(tmp.path(), "junk"), None);
        assert_eq!(determine_pid(tmp.path(), "zero"), None);
        assert_eq!(determine_pid(tmp.path(), "negative"), None);
        assert_eq!(determine_pid(tmp.path(), "missing"), None);
    }
}

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

use anyhow::{bail, Result};
use std::path::PathBuf;

/// The declarative description of one supervised program.  Immutable after
/// creation; shared between the supervisor and the watch's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    /// Unique identifier; also names the watch's PID file.
    pub name: String,
    /// The command line.  The first element is resolved via `PATH`.
    pub start: Vec<String>,
    /// User to run the child as, by name.
    pub uid: Option<String>,
    /// Group to run the child as, by name.
    pub gid: Option<String>,
    /// Working directory for the child.
    pub dir: Option<PathBuf>,
}

impl Watch {
    pub fn new(
        name: String,
        start: Vec<String>,
        uid: Option<String>,
        gid: Option<String>,
        dir: Option<PathBuf>,
    ) -> Result<Watch> {
        if name.is_empty() {
            bail!("watch with empty name");
        }
        if start.is_empty() || start[0].is_empty() {
            bail!("watch '{name}' has no start command");
        }
        Ok(Watch {
            name,
            start,
            uid,
            gid,
            dir,
        })
    }

    pub fn executable(&self) -> &str {
        &self.start[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_start() {
        assert!(Watch::new("w".into(), vec![], None, None, None).is_err());
        assert!(Watch::new("w".into(), vec![String::new()], None, None, None).is_err());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(Watch::new(String::new(), vec!["/bin/true".into()], None, None, None).is_err());
    }

    #[test]
    fn executable_is_argv0() {
        let watch = Watch::new(
            "w".into(),
            vec!["/bin/true".into(), "--flag".into()],
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(watch.executable(), "/bin/true");
    }
}

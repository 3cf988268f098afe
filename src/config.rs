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

//! Watch configuration loading.
//!
//! Watches are declared in a TOML file:
//!
//! ```toml
//! [watch.redis]
//! start = ["/usr/bin/redis-server", "--port", "7777"]
//! uid = "redis"
//! gid = "redis"
//! dir = "/var/lib/redis"
//! ```

use crate::watch::Watch;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    watch: BTreeMap<String, WatchConfig>,
}

#[derive(Debug, Deserialize)]
struct WatchConfig {
    start: Vec<String>,
    uid: Option<String>,
    gid: Option<String>,
    dir: Option<PathBuf>,
}

/// Loads and validates the watch definitions from `path`.
pub fn load(path: &Path) -> Result<Vec<Watch>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("{}: could not read config file", path.display()))?;
    parse(&text).with_context(|| format!("{}: invalid config file", path.display()))
}

fn parse(text: &str) -> Result<Vec<Watch>> {
    let config: ConfigFile = toml::from_str(text)?;
    if config.watch.is_empty() {
        bail!("no watches defined");
    }
    config
        .watch
        .into_iter()
        .map(|(name, watch)| Watch::new(name, watch.start, watch.uid, watch.gid, watch.dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_watch() {
        let watches = parse(
            r#"
            [watch.redis]
            start = ["/usr/bin/redis-server", "--port", "7777"]
            uid = "redis"
            gid = "redis"
            dir = "/var/lib/redis"

            [watch.cat]
            start = ["cat"]
            "#,
        )
        .unwrap();

        assert_eq!(watches.len(), 2);
        let redis = watches.iter().find(|w| w.name == "redis").unwrap();
        assert_eq!(redis.start.len(), 3);
        assert_eq!(redis.uid.as_deref(), Some("redis"));
        assert_eq!(redis.gid.as_deref(), Some("redis"));
        assert_eq!(redis.dir.as_deref(), Some(Path::new("/var/lib/redis")));
        let cat = watches.iter().find(|w| w.name == "cat").unwrap();
        assert_eq!(cat.uid, None);
    }

    #[test]
    fn empty_start_is_an_error() {
        assert!(parse("[watch.w]\nstart = []\n").is_err());
    }

    #[test]
    fn no_watches_is_an_error() {
        assert!(parse("").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Path::new("/no/such/nyx.toml")).is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nyx.toml");
        std::fs::write(&path, "[watch.w]\nstart = [\"/bin/true\"]\n").unwrap();
        let watches = load(&path).unwrap();
        assert_eq!(watches[0].name, "w");
    }
}

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

//! The supervisor: owns the watches, their state machines, the wakeup
//! channel and the event loop.

use crate::event;
use crate::pidfile;
use crate::signals;
use crate::state::{self, State};
use crate::wakeup::WakeupFd;
use crate::watch::Watch;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{event as trace_event, Level};

/// How long a watch is given to come up before its start counts as failed,
/// unless its configuration says otherwise.
const DEFAULT_START_TIMEOUT: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Log via the system logger.
    pub syslog: bool,
    /// Only log errors.
    pub quiet: bool,
    /// Disable ANSI colouring.
    pub no_color: bool,
}

/// The root structure tying the supervisor together.
pub struct Nyx {
    pid: u32,
    is_init: bool,
    def_start_timeout: u64,
    options: Options,
    pid_dir: PathBuf,
    wakeup: WakeupFd,
    watches: HashMap<String, Arc<Watch>>,
    states: Vec<Arc<State>>,
}

impl Nyx {
    /// Allocates the supervisor: selects the PID directory, records our own
    /// pid and opens the wakeup channel.  Watches are added separately.
    pub fn initialize(options: Options) -> Result<Nyx> {
        let pid_dir = pidfile::select_pid_dir()?;
        let wakeup = WakeupFd::new().context("creating wakeup channel")?;
        let pid = std::process::id();

        Ok(Nyx {
            pid,
            is_init: pid == 1,
            def_start_timeout: DEFAULT_START_TIMEOUT,
            options,
            pid_dir,
            wakeup,
            watches: HashMap::new(),
            states: Vec::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn def_start_timeout(&self) -> u64 {
        self.def_start_timeout
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pid_dir(&self) -> &Path {
        &self.pid_dir
    }

    pub fn states(&self) -> &[Arc<State>] {
        &self.states
    }

    pub fn add_watches(&mut self, watches: Vec<Watch>) -> Result<()> {
        for watch in watches {
            if self.watches.contains_key(&watch.name) {
                bail!("duplicate watch '{}'", watch.name);
            }
            self.watches.insert(watch.name.clone(), Arc::new(watch));
        }
        Ok(())
    }

    /// Builds one state machine per watch and starts each on its own
    /// thread.  Failure to start any thread is fatal to initialisation.
    pub fn watches_init(&mut self) -> Result<()> {
        for watch in self.watches.values() {
            let state = Arc::new(State::new(Arc::clone(watch), self.pid_dir.clone()));
            let handle = thread::Builder::new()
                .name(format!("state-{}", watch.name))
                .spawn({
                    let state = Arc::clone(&state);
                    move || state::state_loop(&state)
                })
                .with_context(|| format!("starting state thread for watch '{}'", watch.name))?;
            state.set_thread(handle);
            self.states.push(state);
        }
        Ok(())
    }

    /// Installs SIGTERM/SIGINT/SIGCHLD handling targeting our wakeup
    /// channel.
    pub fn install_signals(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        signals::install(self.wakeup.as_raw_fd()).context("installing signal handlers")
    }

    /// Opens and subscribes the kernel event feed and runs the event loop
    /// until shutdown; afterwards the feed is unsubscribed and closed.
    pub fn run(&self) -> Result<()> {
        let socket = event::connect()?;
        event::subscribe(&socket)?;

        let result = event::event_loop(&socket, &self.wakeup, self, |pid, ev, nyx| {
            state::dispatch_event(pid, ev, nyx);
        });

        if let Err(err) = event::unsubscribe(&socket) {
            trace_event!(Level::WARN, "{err:#}");
        }

        result
    }

    /// Tears the supervisor down: every state machine is sent to `quit`
    /// and joined, then the watches go away.  The wakeup channel stays
    /// open until the signal handlers are gone, and closes last when the
    /// supervisor is dropped.
    pub fn destroy(&mut self) {
        for state in self.states.drain(..) {
            state::state_destroy(&state);
        }
        self.watches.clear();
        signals::uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateValue;
    use serial_test::serial;
    use std::time::{Duration, Instant};

    fn options() -> Options {
        Options::default()
    }

    fn watch(name: &str, argv: &[&str]) -> Watch {
        Watch::new(
            name.into(),
            argv.iter().map(|s| s.to_string()).collect(),
            None,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn initialize_selects_a_pid_dir() {
        let nyx = Nyx::initialize(options()).unwrap();
        assert!(nyx.pid_dir().is_dir());
        assert_eq!(nyx.pid(), std::process::id());
        assert!(!nyx.is_init());
        assert_eq!(nyx.def_start_timeout(), 5);
    }

    #[test]
    fn duplicate_watches_are_rejected() {
        let mut nyx = Nyx::initialize(options()).unwrap();
        nyx.add_watches(vec![watch("w", &["/bin/true"])]).unwrap();
        assert!(nyx.add_watches(vec![watch("w", &["/bin/true"])]).is_err());
    }

    #[test]
    #[serial]
    fn lifecycle_spawns_and_destroys_state_machines() {
        let mut nyx = Nyx::initialize(options()).unwrap();
        nyx.add_watches(vec![
            watch("one", &["/no/such/binary-one"]),
            watch("two", &["/no/such/binary-two"]),
        ])
        .unwrap();
        nyx.watches_init().unwrap();
        assert_eq!(nyx.states().len(), 2);

        // the warm-up pass settles each watch without a pid file into the
        // spawn path
        let deadline = Instant::now() + Duration::from_secs(5);
        for state in nyx.states() {
            while state.value() != StateValue::Starting {
                assert!(Instant::now() < deadline, "state machine never started");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        nyx.destroy();
        assert!(nyx.states().is_empty());
    }
}

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

//! Per-watch state machines.
//!
//! Every watch owns a [`State`]: its current lifecycle value, the last
//! known child pid and a counting semaphore.  A dedicated thread blocks on
//! the semaphore and, whenever the value changes, runs the transition
//! action the table below prescribes.  [`set_state`](State::set_state) is
//! the only way other threads move a state machine: it writes the new
//! value and then posts the semaphore exactly once, so the owning thread
//! observes every write.
//!
//! The transition table (rows = from, columns = to; empty cells are
//! illegal and roll the value back):
//!
//! ```text
//!              unmonitored  starting  running  stopping  stopped
//! init         to_unmon     .         .        .         .
//! unmonitored  .            start     running  stop      stopped
//! starting     to_unmon     .         running  stop      stopped
//! running      to_unmon     .         .        stop      stopped
//! stopping     to_unmon     .         .        .         stopped
//! stopped      to_unmon     start     .        .         .
//! ```
//!
//! `quit` is a sink: the thread exits on observing it and runs no further
//! action.

use crate::fs;
use crate::nyx::Nyx;
use crate::pidfile;
use crate::sys;
use crate::watch::Watch;
use anyhow::{bail, Result};
use libc::{c_char, pid_t};
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::exit;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{event, Level};

use crate::event::Event;
use crate::wakeup::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateValue {
    Init,
    Unmonitored,
    Starting,
    Running,
    Stopping,
    Stopped,
    Quit,
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StateValue::Init => "init",
            StateValue::Unmonitored => "unmonitored",
            StateValue::Starting => "starting",
            StateValue::Running => "running",
            StateValue::Stopping => "stopping",
            StateValue::Stopped => "stopped",
            StateValue::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// Runtime pairing of a watch with its lifecycle value and child pid.
pub struct State {
    watch: Arc<Watch>,
    pid_dir: PathBuf,
    value: Mutex<StateValue>,
    pid: AtomicI32,
    sem: Semaphore,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl State {
    /// Creates the state in `unmonitored` with a semaphore count of 1, so
    /// the state thread performs one warm-up pass (`init → unmonitored`)
    /// immediately after startup.
    pub fn new(watch: Arc<Watch>, pid_dir: PathBuf) -> State {
        State {
            watch,
            pid_dir,
            value: Mutex::new(StateValue::Unmonitored),
            pid: AtomicI32::new(0),
            sem: Semaphore::new(1),
            thread: Mutex::new(None),
        }
    }

    pub fn watch(&self) -> &Watch {
        &self.watch
    }

    pub fn value(&self) -> StateValue {
        *self.value.lock().unwrap()
    }

    pub fn pid(&self) -> pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    fn set_pid(&self, pid: pid_t) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// Writes the new lifecycle value and posts the wakeup semaphore
    /// exactly once.  The only legal way to move a state machine from
    /// another thread.
    pub fn set_state(&self, value: StateValue) {
        *self.value.lock().unwrap() = value;
        self.sem.post();
    }

    /// Restores a value after a failed transition, without posting.
    fn rollback(&self, value: StateValue) {
        *self.value.lock().unwrap() = value;
    }

    pub fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap() = Some(handle);
    }
}

type TransitionFn = fn(&State, StateValue, StateValue) -> Result<()>;

/// The transition table, flattened to a match over `(from, to)`.  A `None`
/// cell means the transition is illegal.
fn transition_for(from: StateValue, to: StateValue) -> Option<TransitionFn> {
    use StateValue::*;
    match (from, to) {
        (Init, Unmonitored) => Some(to_unmonitored),

        (Unmonitored, Starting) => Some(start),
        (Unmonitored, Running) => Some(running),
        (Unmonitored, Stopping) => Some(stop),
        (Unmonitored, Stopped) => Some(stopped),

        (Starting, Unmonitored) => Some(to_unmonitored),
        (Starting, Running) => Some(running),
        (Starting, Stopping) => Some(stop),
        (Starting, Stopped) => Some(stopped),

        (Running, Unmonitored) => Some(to_unmonitored),
        (Running, Stopping) => Some(stop),
        (Running, Stopped) => Some(stopped),

        (Stopping, Unmonitored) => Some(to_unmonitored),
        (Stopping, Stopped) => Some(stopped),

        (Stopped, Unmonitored) => Some(to_unmonitored),
        (Stopped, Starting) => Some(start),

        _ => None,
    }
}

/// Figures out whether the watched program is already running: takes the
/// recorded pid, falls back to the PID file, probes the candidate for
/// liveness, and settles the state on `running` or `stopped`.
fn to_unmonitored(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    debug_transition(state, from, to);

    let watch = state.watch();
    let mut pid = state.pid();
    let mut running = false;

    if pid < 1 {
        pid = pidfile::determine_pid(&state.pid_dir, &watch.name).unwrap_or(0);
    }

    if pid > 0 {
        running = sys::check_process_running(pid);
        state.set_pid(if running { pid } else { 0 });
    }

    state.set_state(if running {
        StateValue::Running
    } else {
        StateValue::Stopped
    });

    Ok(())
}

fn start(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    debug_transition(state, from, to);

    let pid = spawn(state);
    if pid > 0 {
        state.set_pid(pid);
    }

    Ok(())
}

/// Entry point for termination requests.  Nothing asks a watch to stop
/// yet, so this only records that the request arrived.
fn stop(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    debug_transition(state, from, to);

    Ok(())
}

/// The child is gone: forget its pid and schedule a fresh spawn.
fn stopped(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    debug_transition(state, from, to);

    state.set_pid(0);
    state.set_state(StateValue::Starting);

    Ok(())
}

fn running(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    debug_transition(state, from, to);

    Ok(())
}

fn debug_transition(state: &State, from: StateValue, to: StateValue) {
    event!(
        Level::DEBUG,
        "State transition function of watch '{}' from {} to {}",
        state.watch().name,
        from,
        to
    );
}

/// Everything the child half of [`spawn`] needs, resolved in the parent:
/// `argv` is a null-terminated pointer array into caller-owned strings,
/// the identity is already numeric, and the working directory is already
/// checked for existence.
struct ChildImage<'a> {
    executable: &'a CStr,
    argv: &'a [*const c_char],
    user: Option<&'a CStr>,
    uid: libc::uid_t,
    gid: libc::gid_t,
    workdir: &'a CStr,
}

/// Forks the watched program.  The parent returns the child pid; the child
/// sets up its identity, session and file descriptors and execs.
fn spawn(state: &State) -> pid_t {
    let watch = state.watch();

    // Everything the child needs is resolved before fork: only the forking
    // thread survives in the child, so heap allocation (and the user
    // database behind it) is off the table there.
    let argv: Vec<CString> = watch
        .start
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .unwrap_or_default();
    if argv.is_empty() {
        event!(
            Level::ERROR,
            "watch '{}': start command is not executable",
            watch.name
        );
        return 0;
    }
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    let user = watch
        .uid
        .as_ref()
        .and_then(|name| CString::new(name.as_str()).ok());
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    if let Some(ref name) = user {
        if let Ok(Some((pw_uid, pw_gid))) = sys::get_user(name) {
            uid = pw_uid;
            gid = pw_gid;
        }
    }
    if let Some(ref name) = watch.gid {
        if let Ok(name) = CString::new(name.as_str()) {
            if let Ok(Some(gr_gid)) = sys::get_group(&name) {
                gid = gr_gid;
            }
        }
    }

    let workdir = match watch.dir {
        Some(ref dir) if fs::dir_exists(dir) => CString::new(dir.as_os_str().as_bytes()).ok(),
        _ => None,
    }
    .unwrap_or_else(|| CString::new("/").unwrap());

    let image = ChildImage {
        executable: &argv[0],
        argv: &argv_ptrs,
        user: user.as_deref(),
        uid,
        gid,
        workdir: &workdir,
    };

    match unsafe { sys::xfork() } {
        Some(pid) => pid,
        None => exec_child(watch, &image),
    }
}

/// Child-side half of [`spawn`], working only with what the parent
/// prepared.  The order matters: identity drops before exec, supplementary
/// groups before the primary group is finalised, and file descriptors are
/// normalised after the session detach so no controlling-terminal state is
/// inherited.
fn exec_child(watch: &Watch, image: &ChildImage) -> ! {
    sys::umask(0);

    let _ = sys::setsid();

    if image.gid != 0 {
        let _ = sys::setgroups(&[image.gid]);
        let _ = sys::setgid(image.gid);
    }
    if image.uid != 0 && image.gid != 0 {
        if let Some(user) = image.user {
            let _ = sys::initgroups(user, image.gid);
        }
    }
    if image.uid != 0 {
        let _ = sys::setuid(image.uid);
    }

    let _ = sys::chdir(image.workdir);

    sys::redirect_standard_fds();

    let err = unsafe { sys::execvp(image.executable, image.argv) };

    // a missing binary means there is nothing to supervise
    if err.raw_os_error() == Some(libc::ENOENT) {
        exit(0);
    }

    event!(Level::ERROR, "execvp {} failed ({err})", watch.executable());
    exit(1);
}

fn process_state(state: &State, from: StateValue, to: StateValue) -> Result<()> {
    event!(
        Level::DEBUG,
        "Watch '{}' (PID {}): {} -> {}",
        state.watch().name,
        state.pid(),
        from,
        to
    );

    match transition_for(from, to) {
        Some(func) => func(state, from, to),
        None => bail!("transition from {from} to {to} is not valid"),
    }
}

/// The state machine loop, run on the watch's dedicated thread.
///
/// Blocks on the semaphore; on each wake reads the current value once.
/// `quit` terminates the loop.  An unchanged value is a spurious wake and
/// a no-op.  A changed value runs the transition action; failure restores
/// the previous value and logs a warning.
pub fn state_loop(state: &State) {
    let watch = state.watch();
    let mut last = StateValue::Init;

    event!(
        Level::DEBUG,
        "Starting state loop for watch '{}'",
        watch.name
    );

    loop {
        state.sem.wait();
        let current = state.value();

        if current == StateValue::Quit {
            event!(Level::INFO, "Watch '{}' terminating", watch.name);
            break;
        }

        if current != last {
            if let Err(err) = process_state(state, last, current) {
                state.rollback(last);
                event!(
                    Level::WARN,
                    "Processing state of watch '{}' failed (PID {}): {err}",
                    watch.name,
                    state.pid()
                );
            }
        } else {
            event!(
                Level::DEBUG,
                "Watch '{}' (PID {}): state stayed {}",
                watch.name,
                state.pid(),
                last
            );
        }

        last = current;
    }
}

/// Shuts a state machine down: `quit` wakes the thread, which exits
/// without running any transition action, and is then joined.
pub fn state_destroy(state: &State) {
    state.set_state(StateValue::Quit);

    let handle = state.thread.lock().unwrap().take();
    if let Some(handle) = handle {
        event!(
            Level::DEBUG,
            "Waiting for state thread of watch '{}' to terminate",
            state.watch().name
        );
        if handle.join().is_err() {
            event!(
                Level::ERROR,
                "Joining of state thread of watch '{}' failed",
                state.watch().name
            );
        }
    }
}

/// Hook for decoded kernel events.
///
/// Deliberately does not drive the state machines: the connector feed and
/// the poll results overlap, and the poll path owns the transition today.
/// An implementation that wants kernel events to move watches directly can
/// look the state up by pid here and signal `stopped` on exits.
pub fn dispatch_event(pid: pid_t, ev: &Event, _nyx: &Nyx) {
    event!(Level::DEBUG, "Incoming event data for PID {pid}: {ev:?}");
}

/// Applies an externally polled liveness verdict: every state holding this
/// pid is nudged towards `running` or `stopped`, but only when that
/// actually changes its value.
pub fn dispatch_poll_result(pid: pid_t, is_running: bool, nyx: &Nyx) {
    event!(
        Level::DEBUG,
        "Incoming polling data for PID {pid}: running: {is_running}"
    );
    dispatch_poll_states(pid, is_running, nyx.states());
}

fn dispatch_poll_states(pid: pid_t, is_running: bool, states: &[Arc<State>]) {
    for state in states {
        if state.pid() == pid {
            let next = if is_running {
                StateValue::Running
            } else {
                StateValue::Stopped
            };
            if next != state.value() {
                state.set_state(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_watch(name: &str, start: &[&str]) -> Arc<Watch> {
        Arc::new(
            Watch::new(
                name.into(),
                start.iter().map(|s| s.to_string()).collect(),
                None,
                None,
                None,
            )
            .unwrap(),
        )
    }

    fn spawn_state(watch: Arc<Watch>, pid_dir: PathBuf) -> Arc<State> {
        let state = Arc::new(State::new(watch, pid_dir));
        let handle = {
            let state = Arc::clone(&state);
            thread::spawn(move || state_loop(&state))
        };
        state.set_thread(handle);
        state
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn legal_transitions_match_the_table() {
        use StateValue::*;
        let all = [Init, Unmonitored, Starting, Running, Stopping, Stopped, Quit];
        let legal = [
            (Init, Unmonitored),
            (Unmonitored, Starting),
            (Unmonitored, Running),
            (Unmonitored, Stopping),
            (Unmonitored, Stopped),
            (Starting, Unmonitored),
            (Starting, Running),
            (Starting, Stopping),
            (Starting, Stopped),
            (Running, Unmonitored),
            (Running, Stopping),
            (Running, Stopped),
            (Stopping, Unmonitored),
            (Stopping, Stopped),
            (Stopped, Unmonitored),
            (Stopped, Starting),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    transition_for(from, to).is_some(),
                    legal.contains(&(from, to)),
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn quit_has_no_outgoing_transitions() {
        use StateValue::*;
        for to in [Init, Unmonitored, Starting, Running, Stopping, Stopped, Quit] {
            assert!(transition_for(Quit, to).is_none());
        }
    }

    #[test]
    fn illegal_transition_fails_and_keeps_the_value() {
        let tmp = tempfile::tempdir().unwrap();
        let state = State::new(test_watch("w", &["/bin/true"]), tmp.path().into());

        let result = process_state(&state, StateValue::Stopping, StateValue::Starting);
        assert!(result.is_err());
        assert_eq!(state.value(), StateValue::Unmonitored);
    }

    #[test]
    fn warm_start_discovers_a_running_child() {
        let tmp = tempfile::tempdir().unwrap();
        // our own pid is as alive as it gets
        let own_pid = std::process::id();
        std::fs::write(tmp.path().join("w"), format!("{own_pid}\n")).unwrap();

        let state = spawn_state(test_watch("w", &["/bin/true"]), tmp.path().into());

        wait_for("running after warm start", || {
            state.value() == StateValue::Running
        });
        assert_eq!(state.pid(), own_pid as pid_t);

        state_destroy(&state);
    }

    #[test]
    fn warm_start_with_dead_pid_clears_it() {
        let tmp = tempfile::tempdir().unwrap();
        // a pid from the far end of the default pid_max range
        std::fs::write(tmp.path().join("w"), b"4194000").unwrap();

        let state = spawn_state(test_watch("w", &["/no/such/binary"]), tmp.path().into());

        // cold path: stopped -> starting -> spawn of a missing binary
        wait_for("starting after discovery", || {
            state.value() == StateValue::Starting
        });

        state_destroy(&state);
    }

    #[test]
    #[serial]
    fn cold_start_spawns_and_poll_result_promotes() {
        let tmp = tempfile::tempdir().unwrap();
        let state = spawn_state(test_watch("w", &["sleep", "30"]), tmp.path().into());

        // no pid file: unmonitored -> stopped -> starting -> spawn
        wait_for("child spawn", || {
            state.value() == StateValue::Starting && state.pid() > 0
        });
        let pid = state.pid();

        dispatch_poll_states(pid, true, std::slice::from_ref(&state));
        wait_for("promotion to running", || {
            state.value() == StateValue::Running
        });

        // child exits: stopped schedules a fresh spawn
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        dispatch_poll_states(pid, false, std::slice::from_ref(&state));
        wait_for("respawn", || {
            state.value() == StateValue::Starting && state.pid() != pid && state.pid() > 0
        });

        let respawned = state.pid();
        state_destroy(&state);
        unsafe {
            libc::kill(respawned, libc::SIGKILL);
            libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG);
            libc::waitpid(respawned, std::ptr::null_mut(), libc::WNOHANG);
        }
    }

    #[test]
    #[serial]
    fn rejected_transition_rolls_back_at_the_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        std::fs::write(tmp.path().join("w"), format!("{own_pid}")).unwrap();

        let state = spawn_state(test_watch("w", &["/bin/true"]), tmp.path().into());
        wait_for("running after warm start", || {
            state.value() == StateValue::Running
        });

        // running -> starting is not in the table
        state.set_state(StateValue::Starting);
        wait_for("rollback to running", || {
            state.value() == StateValue::Running
        });

        state_destroy(&state);
    }

    #[test]
    fn quit_dominates_and_the_thread_exits() {
        let tmp = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        std::fs::write(tmp.path().join("w"), format!("{own_pid}")).unwrap();

        let state = spawn_state(test_watch("w", &["/bin/true"]), tmp.path().into());
        wait_for("running after warm start", || {
            state.value() == StateValue::Running
        });

        // joins without running any further transition action
        state_destroy(&state);
        assert_eq!(state.value(), StateValue::Quit);
        assert!(state.thread.lock().unwrap().is_none());
    }

    #[test]
    fn same_value_wake_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let own_pid = std::process::id();
        std::fs::write(tmp.path().join("w"), format!("{own_pid}")).unwrap();

        let state = spawn_state(test_watch("w", &["/bin/true"]), tmp.path().into());
        wait_for("running after warm start", || {
            state.value() == StateValue::Running
        });

        state.set_state(StateValue::Running);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(state.value(), StateValue::Running);
        assert_eq!(state.pid(), own_pid as pid_t);

        state_destroy(&state);
    }

    #[test]
    fn poll_result_only_writes_on_change() {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(State::new(test_watch("w", &["/bin/true"]), tmp.path().into()));
        state.set_pid(4321);
        // no thread is running; the initial semaphore unit is still pending
        state.sem.wait();

        // state is unmonitored; running=true differs -> one set_state
        dispatch_poll_states(4321, true, std::slice::from_ref(&state));
        assert_eq!(state.value(), StateValue::Running);
        state.sem.wait();

        // same verdict again: no write, no post
        dispatch_poll_states(4321, true, std::slice::from_ref(&state));
        assert_eq!(state.value(), StateValue::Running);
        assert!(!state.sem.try_wait());

        // other pids are left alone
        dispatch_poll_states(9999, false, std::slice::from_ref(&state));
        assert_eq!(state.value(), StateValue::Running);
        assert!(!state.sem.try_wait());
    }
}

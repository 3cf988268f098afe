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

//! System call wrappers.
//!
//! All of the crate's `unsafe` libc calls live here, as thin wrappers that
//! return `std::io::Error` on failure.  The ones whose names begin with `x`
//! log the error and exit the process.

use libc::{self, c_char, c_int};
use std::ffi::{CStr, CString};
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::exit;
use std::ptr;
use tracing::{event, Level};

/// Opens a datagram socket on the netlink connector family, bound to the
/// calling process and the given multicast group set.
pub fn netlink_socket(groups: u32) -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::socket(libc::PF_NETLINK, libc::SOCK_DGRAM, libc::NETLINK_CONNECTOR) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = groups;
    addr.nl_pid = unsafe { libc::getpid() } as u32;

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

pub fn send(fd: RawFd, buf: &[u8]) -> Result<(), Error> {
    let rc = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Receives one datagram.  Returns `Ok(0)` on orderly socket shutdown.
/// `EINTR` is **not** retried here; the event loop decides what an
/// interrupted receive means.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, Error> {
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc as usize)
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn epoll_create() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::epoll_create1(0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Registers `fd` for input readiness, with `fd` itself as the event token.
pub fn epoll_add(epfd: RawFd, fd: RawFd) -> Result<(), Error> {
    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Waits without timeout for readiness, retrying on `EINTR`.
pub fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event]) -> Result<usize, Error> {
    loop {
        let rc =
            unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as c_int, -1) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Creates a counter-backed event descriptor with an initial count of 0.
pub fn eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reads an eventfd, returning the accumulated counter value and resetting
/// its readiness.
pub fn eventfd_read(fd: RawFd) -> Result<u64, Error> {
    let mut value: u64 = 0;
    let rc = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(value)
}

/// # Safety
///
/// Forking a multi-threaded process leaves only the calling thread alive in
/// the child; the child must restrict itself to exec-or-exit work.
pub unsafe fn fork() -> Result<Option<libc::pid_t>, Error> {
    let pid = libc::fork();
    if pid < 0 {
        Err(Error::last_os_error())
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

pub unsafe fn xfork() -> Option<libc::pid_t> {
    match fork() {
        Ok(result) => result,
        Err(error) => {
            event!(Level::ERROR, "fork failed ({error})");
            exit(1);
        }
    }
}

pub fn waitpid(pid: libc::pid_t, flags: c_int) -> Result<(libc::pid_t, c_int), Error> {
    loop {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(pid, &mut status as *mut c_int, flags) };
        if retval != -1 {
            return Ok((retval, status));
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn setsid() -> Result<libc::pid_t, Error> {
    let rc = unsafe { libc::setsid() };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc)
}

pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

pub fn setgroups(groups: &[libc::gid_t]) -> Result<(), Error> {
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn setgid(gid: libc::gid_t) -> Result<(), Error> {
    if unsafe { libc::setgid(gid) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn setuid(uid: libc::uid_t) -> Result<(), Error> {
    if unsafe { libc::setuid(uid) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn initgroups(user: &CStr, gid: libc::gid_t) -> Result<(), Error> {
    if unsafe { libc::initgroups(user.as_ptr(), gid) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// `getpwnam_r`/`getgrnam_r` signal "no such entry" either as a null result
/// or as one of these error numbers, depending on the libc.
fn is_not_found(rc: c_int) -> bool {
    matches!(rc, libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM)
}

/// Looks up a user by name in the platform user database.  Returns the uid
/// and the user's primary gid, or `None` when no such user exists.
pub fn get_user(name: &CStr) -> Result<Option<(libc::uid_t, libc::gid_t)>, Error> {
    let mut pwd: libc::passwd = unsafe { mem::zeroed() };
    let mut buf = vec![0 as c_char; 1024];
    let mut result: *mut libc::passwd = ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getpwnam_r(
                name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        return match rc {
            0 if result.is_null() => Ok(None),
            0 => Ok(Some((pwd.pw_uid, pwd.pw_gid))),
            libc::ERANGE if buf.len() < 1 << 16 => {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            rc if is_not_found(rc) => Ok(None),
            rc => Err(Error::from_raw_os_error(rc)),
        };
    }
}

/// Looks up a group by name.  Returns its gid, or `None` when no such group
/// exists.
pub fn get_group(name: &CStr) -> Result<Option<libc::gid_t>, Error> {
    let mut grp: libc::group = unsafe { mem::zeroed() };
    let mut buf = vec![0 as c_char; 1024];
    let mut result: *mut libc::group = ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getgrnam_r(
                name.as_ptr(),
                &mut grp,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        return match rc {
            0 if result.is_null() => Ok(None),
            0 => Ok(Some(grp.gr_gid)),
            libc::ERANGE if buf.len() < 1 << 16 => {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            rc if is_not_found(rc) => Ok(None),
            rc => Err(Error::from_raw_os_error(rc)),
        };
    }
}

/// Probes whether a process with the given pid exists.  `EPERM` counts as
/// running: the process is there, we merely may not signal it.
pub fn check_process_running(pid: libc::pid_t) -> bool {
    if pid < 1 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Closes stdin, stdout and stderr and reopens fds 0/1/2 on `/dev/null` in
/// the conventional modes (read-only, write-only, read-write, in that
/// order).  Failures are ignored; there is nowhere left to report them.
pub fn redirect_standard_fds() {
    const DEV_NULL: *const c_char = b"/dev/null\0".as_ptr() as *const c_char;
    unsafe {
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);

        libc::open(DEV_NULL, libc::O_RDONLY);
        libc::open(DEV_NULL, libc::O_WRONLY);
        libc::open(DEV_NULL, libc::O_RDWR);
    }
}

pub fn chdir(path: &CStr) -> Result<(), Error> {
    if unsafe { libc::chdir(path.as_ptr()) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Replaces the process image, resolving `file` against `PATH`.  Only
/// returns on failure.  Takes a ready-made pointer array so a forked child
/// can call this without touching the heap.
///
/// # Safety
///
/// `argv` must be a null-terminated array of pointers to valid
/// null-terminated strings that outlive the call.
pub unsafe fn execvp(file: &CStr, argv: &[*const c_char]) -> Error {
    libc::execvp(file.as_ptr(), argv.as_ptr());
    Error::last_os_error()
}

static SYSLOG_IDENT: [u8; 4] = *b"nyx\0";

pub fn openlog() {
    unsafe {
        libc::openlog(
            SYSLOG_IDENT.as_ptr() as *const c_char,
            libc::LOG_PID,
            libc::LOG_DAEMON,
        );
    }
}

pub fn syslog(priority: c_int, message: &str) {
    let message = match CString::new(message) {
        Ok(message) => message,
        Err(_) => return,
    };
    unsafe {
        libc::syslog(
            priority,
            b"%s\0".as_ptr() as *const c_char,
            message.as_ptr(),
        );
    }
}

use crate::debugger::debugee::tracee::TraceeStatus::{Running, Stopped};
use itertools::Itertools;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped,
    Running,
}

/// Tracee is a thread attached to the debugger with ptrace.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    /// Tracee thread id.
    pub pid: Pid,
    /// Tracee current status.
    pub status: TraceeStatus,
}

impl Tracee {
    /// Wait for change of the tracee status.
    pub fn wait_one(&self) -> nix::Result<WaitStatus> {
        debug!(target: "tracer", "wait for tracee status, thread {pid}", pid = self.pid);
        let status = waitpid(self.pid, Some(WaitPidFlag::__WALL))?;
        debug!(target: "tracer", "receive tracee status, thread {pid}, status: {status:?}", pid = self.pid);
        Ok(status)
    }

    fn update_status(&mut self, status: TraceeStatus) {
        debug!(
            target: "tracer",
            "tracee accept new status ({status:?}), thread: {pid}",
            pid = self.pid
        );
        self.status = status
    }

    /// Resume tracee, if signal is some - inject signal while resuming.
    pub fn r#continue(&mut self, sig: Option<Signal>) -> nix::Result<()> {
        debug!(
            target: "tracer",
            "continue tracee execution with signal {sig:?}, thread: {pid}",
            pid = self.pid,
        );

        sys::ptrace::cont(self.pid, sig).map(|ok| {
            self.update_status(Running);
            ok
        })
    }

    /// Set tracee status into stop.
    ///
    /// Note: this function does not actually stop the tracee.
    pub fn stop(&mut self) {
        self.update_status(Stopped);
    }

    /// Returns true if tracee is in a stopped status.
    pub fn is_stopped(&self) -> bool {
        self.status == Stopped
    }
}

/// Registry of all threads of the debugee process.
pub struct TraceeCtl {
    process_pid: Pid,
    threads_state: HashMap<Pid, Tracee>,
}

impl TraceeCtl {
    pub fn new(proc_pid: Pid) -> TraceeCtl {
        Self {
            process_pid: proc_pid,
            threads_state: HashMap::from([(
                proc_pid,
                Tracee {
                    pid: proc_pid,
                    status: Stopped,
                },
            )]),
        }
    }

    pub(crate) fn tracee(&self, pid: Pid) -> Option<&Tracee> {
        self.threads_state.get(&pid)
    }

    pub(crate) fn tracee_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.threads_state.get_mut(&pid)
    }

    pub(crate) fn tracee_ensure_mut(&mut self, pid: Pid) -> &mut Tracee {
        self.tracee_mut(pid).expect("tracee must exist")
    }

    /// Return pid of the debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Adds a thread to the registry in a stopped state.
    pub fn add(&mut self, pid: Pid) -> &Tracee {
        debug!(target: "tracer", "add new tracee, thread: {pid}");
        let new = Tracee {
            pid,
            status: Stopped,
        };
        self.threads_state.insert(pid, new);
        &self.threads_state[&pid]
    }

    /// Remove a thread from the registry.
    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        debug!(target: "tracer", "try to remove tracee, thread: {pid}");
        self.threads_state.remove(&pid)
    }

    /// Continue all currently stopped tracees.
    ///
    /// # Arguments
    ///
    /// * `inject`: signal to deliver to one of the threads while resuming.
    pub fn cont_stopped(&mut self, inject: Option<(Pid, Signal)>) -> Result<(), anyhow::Error> {
        let mut errors = vec![];
        let (inject_pid, inject_sign) = (inject.map(|s| s.0), inject.map(|s| s.1));

        self.threads_state.iter_mut().for_each(|(_, tracee)| {
            if !tracee.is_stopped() {
                return;
            }

            let resume_sign = if Some(tracee.pid) == inject_pid {
                inject_sign
            } else {
                None
            };

            if let Err(e) = tracee.r#continue(resume_sign) {
                // if no such process - continue, it will be removed later,
                // on PTRACE_EVENT_EXIT event.
                if Errno::ESRCH == e {
                    warn!("thread {} not found, ESRCH", tracee.pid);
                    return;
                }

                errors.push(anyhow::Error::from(e).context(format!("thread: {}", tracee.pid)));
            }
        });

        if !errors.is_empty() {
            anyhow::bail!(errors.into_iter().join(";"))
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Tracee> {
        self.threads_state.values().cloned().collect()
    }
}

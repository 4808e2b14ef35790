//! Processes under test: specs, launching, exit tracking and shutdown
//!
//! Each process runs in its own process group so that signals reach any
//! children it forks (`sh -c` wrappers in particular). Stdout and stderr are
//! piped into one reader thread per stream, which feeds the process's
//! [`OutputCapture`].

use crate::description::{ReadinessTrigger, ReadySignal, Topology};
use crate::lifecycle::CleanupGuard;
use crate::output::{OutputCapture, ProcOutput, Stream};
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to launch process '{name}' ({cmd}): {source}")]
    Spawn {
        name: String,
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start output capture for '{name}': {source}")]
    Capture {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Position of a process within its topology
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub usize);

/// How tests refer to a launched process
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessRef {
    pub id: ProcessId,
    pub name: String,
    pub cmd: Vec<String>,
}

impl ProcessRef {
    pub(crate) fn new(id: ProcessId, spec: &ProcessSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            cmd: spec.cmd.clone(),
        }
    }

    /// Arguments after the executable
    pub fn args(&self) -> &[String] {
        self.cmd.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in self.args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What to launch
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, S>(name: impl Into<String>, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

// =============================================================================
// Exit information
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ProcessStatus {
    NotStarted,
    Running { pid: u32 },
    Exited { returncode: i32 },
}

/// Exit record of one process. Signal deaths use the negated signal number.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessExit {
    pub process: ProcessRef,
    pub returncode: i32,
}

impl ProcessExit {
    fn from_status(process: ProcessRef, status: ExitStatus) -> Self {
        let returncode = status
            .code()
            .or_else(|| status.signal().map(|sig| -sig))
            .unwrap_or(-1);
        Self {
            process,
            returncode,
        }
    }
}

/// Snapshot of which processes have exited and how
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcInfo {
    exits: Vec<ProcessExit>,
}

impl ProcInfo {
    pub fn new(exits: Vec<ProcessExit>) -> Self {
        Self { exits }
    }

    pub fn get(&self, process: &ProcessRef) -> Option<&ProcessExit> {
        self.exits.iter().find(|e| &e.process == process)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessExit> {
        self.exits.iter()
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }
}

// =============================================================================
// Launching
// =============================================================================

struct ProcessHandle {
    process: ProcessRef,
    child: Child,
    status: ProcessStatus,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn is_running(&self) -> bool {
        matches!(self.status, ProcessStatus::Running { .. })
    }

    fn record_exit(&mut self, status: ExitStatus) {
        let exit = ProcessExit::from_status(self.process.clone(), status);
        info!(process = %self.process.name, returncode = exit.returncode, "process exited");
        self.status = ProcessStatus::Exited {
            returncode: exit.returncode,
        };
    }

    fn poll(&mut self) {
        if !self.is_running() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.record_exit(status),
            Ok(None) => {}
            Err(e) => warn!(process = %self.process.name, "try_wait failed: {}", e),
        }
    }

    fn signal_group(&self, signal: Signal) {
        let pid = self.pid();
        if pid <= 0 {
            return;
        }
        // The leader's pid is the group id (see `process_group(0)`)
        let _ = kill(Pid::from_raw(-pid), signal);
    }
}

/// All processes of one run, owned by the runner
pub struct ProcessGroup {
    handles: Vec<ProcessHandle>,
    guard: CleanupGuard,
    /// Each capture thread sends once when its stream closes
    reader_done_tx: Sender<()>,
    reader_done_rx: Receiver<()>,
}

impl ProcessGroup {
    /// Spawn every process of the topology and attach output capture.
    ///
    /// On failure, whatever was already started is shut down before the error
    /// is returned.
    pub fn launch(
        topology: &Topology,
        proc_output: &ProcOutput,
        ready: &ReadySignal,
        extra_env: &BTreeMap<String, String>,
        grace: Duration,
    ) -> Result<Self, LaunchError> {
        let (reader_done_tx, reader_done_rx) = unbounded();
        let mut group = Self {
            handles: Vec::with_capacity(topology.len()),
            guard: CleanupGuard::new(),
            reader_done_tx,
            reader_done_rx,
        };

        for (process, spec) in topology.processes() {
            let capture = proc_output.register(process.clone());
            let ready_text = match topology.readiness() {
                ReadinessTrigger::OutputContains { process: p, text } if p == process => {
                    Some((text.clone(), ready.clone()))
                }
                _ => None,
            };

            if let Err(e) = group.spawn_one(process, spec, capture, ready_text, extra_env) {
                group.shutdown(grace);
                return Err(e);
            }
        }

        Ok(group)
    }

    fn spawn_one(
        &mut self,
        process: &ProcessRef,
        spec: &ProcessSpec,
        capture: Arc<OutputCapture>,
        ready_text: Option<(String, ReadySignal)>,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<(), LaunchError> {
        let mut command = Command::new(&spec.cmd[0]);
        command
            .args(&spec.cmd[1..])
            .envs(extra_env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            name: spec.name.clone(),
            cmd: spec.cmd.join(" "),
            source,
        })?;
        let pid = child.id();
        self.guard.track_group(pid as i32);
        info!(process = %process.name, pid, "launched process");

        let mut readers = Vec::with_capacity(2);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut handle = ProcessHandle {
            process: process.clone(),
            child,
            status: ProcessStatus::Running { pid },
            readers: Vec::new(),
        };

        let done = &self.reader_done_tx;
        let spawned = (|| -> std::io::Result<()> {
            if let Some(out) = stdout {
                readers.push(spawn_reader(
                    out,
                    Stream::Stdout,
                    capture.clone(),
                    ready_text,
                    done.clone(),
                )?);
            }
            if let Some(err) = stderr {
                readers.push(spawn_reader(
                    err,
                    Stream::Stderr,
                    capture.clone(),
                    None,
                    done.clone(),
                )?);
            }
            Ok(())
        })();
        handle.readers = readers;
        self.handles.push(handle);

        spawned.map_err(|source| LaunchError::Capture {
            name: spec.name.clone(),
            source,
        })
    }

    pub fn status(&self, process: &ProcessRef) -> ProcessStatus {
        self.handles
            .iter()
            .find(|h| &h.process == process)
            .map(|h| h.status.clone())
            .unwrap_or(ProcessStatus::NotStarted)
    }

    /// Refresh exit state without blocking and return the current snapshot
    pub fn poll_exits(&mut self) -> ProcInfo {
        for handle in &mut self.handles {
            handle.poll();
        }
        self.proc_info()
    }

    pub fn all_exited(&mut self) -> bool {
        self.poll_exits();
        self.handles.iter().all(|h| !h.is_running())
    }

    pub fn proc_info(&self) -> ProcInfo {
        let exits = self
            .handles
            .iter()
            .filter_map(|h| match h.status {
                ProcessStatus::Exited { returncode } => Some(ProcessExit {
                    process: h.process.clone(),
                    returncode,
                }),
                _ => None,
            })
            .collect();
        ProcInfo::new(exits)
    }

    /// SIGINT every running process group, then SIGKILL whatever is still
    /// alive after `grace`.
    ///
    /// Capture threads get another `grace` to see their pipes close. A
    /// descendant that left the process group (`setsid`) can hold a pipe open
    /// indefinitely; such readers are detached and stop at their next line
    /// once the capture is frozen.
    pub fn shutdown(&mut self, grace: Duration) -> ProcInfo {
        self.poll_exits();

        for handle in self.handles.iter().filter(|h| h.is_running()) {
            debug!(process = %handle.process.name, "sending SIGINT");
            handle.signal_group(Signal::SIGINT);
        }

        let deadline = Instant::now() + grace;
        for handle in self.handles.iter_mut().filter(|h| h.is_running()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.child.wait_timeout(remaining) {
                Ok(Some(status)) => handle.record_exit(status),
                Ok(None) => {
                    warn!(
                        process = %handle.process.name,
                        "did not exit within {:?}, sending SIGKILL",
                        grace
                    );
                    handle.signal_group(Signal::SIGKILL);
                    match handle.child.wait() {
                        Ok(status) => handle.record_exit(status),
                        Err(e) => warn!(process = %handle.process.name, "wait failed: {}", e),
                    }
                }
                Err(e) => warn!(process = %handle.process.name, "wait_timeout failed: {}", e),
            }
        }

        for handle in &mut self.handles {
            // Descendants may still hold the pipes open; take the group down
            handle.signal_group(Signal::SIGKILL);
            self.guard.untrack_group(handle.pid());
        }
        self.join_readers(grace);

        self.proc_info()
    }

    fn join_readers(&mut self, timeout: Duration) {
        let readers: Vec<JoinHandle<()>> = self
            .handles
            .iter_mut()
            .flat_map(|h| h.readers.drain(..))
            .collect();

        let deadline = Instant::now() + timeout;
        let mut finished = 0;
        while finished < readers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reader_done_rx.recv_timeout(remaining) {
                Ok(()) => finished += 1,
                Err(_) => break,
            }
        }

        if finished < readers.len() {
            warn!(
                open = readers.len() - finished,
                "output pipes still open after {:?}, detaching capture threads", timeout
            );
            return;
        }
        for reader in readers {
            let _ = reader.join();
        }
    }
}

/// Sends on drop so a reader reports completion on every exit path
struct DoneNotice(Sender<()>);

impl Drop for DoneNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

fn spawn_reader<R>(
    source: R,
    stream: Stream,
    capture: Arc<OutputCapture>,
    ready: Option<(String, ReadySignal)>,
    done: Sender<()>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = format!("capture-{}-{}", capture.process().name, stream);
    thread::Builder::new().name(name).spawn(move || {
        let _done = DoneNotice(done);
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if capture.append(stream, line).is_err() {
                        break;
                    }
                    if let Some((text, signal)) = &ready {
                        if line.contains(text.as_str()) {
                            debug!(process = %capture.process().name, "readiness text seen");
                            signal.fire();
                        }
                    }
                }
                Err(e) => {
                    debug!(process = %capture.process().name, %stream, "read failed: {}", e);
                    break;
                }
            }
        }
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ready_channel;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, ["sh", "-c", script])
    }

    fn wait_until_exited(group: &mut ProcessGroup) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !group.all_exited() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_process_ref_display() {
        let spec = ProcessSpec::new("talker", ["talker", "--rate", "10"]);
        let process = ProcessRef::new(ProcessId(0), &spec);
        assert_eq!(process.to_string(), "talker --rate 10");
        assert_eq!(process.args(), ["--rate", "10"]);
    }

    #[test]
    fn test_exit_codes_and_signals() {
        let spec = sh("p", "exit 3");
        let process = ProcessRef::new(ProcessId(0), &spec);
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(ProcessExit::from_status(process.clone(), status).returncode, 3);
        let killed = ExitStatus::from_raw(9);
        assert_eq!(ProcessExit::from_status(process, killed).returncode, -9);
    }

    #[test]
    fn test_launch_captures_and_records_exit() {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", "echo hello; echo oops >&2; exit 4"));
        let proc_output = ProcOutput::new();
        let (ready, _waiter) = ready_channel();

        let mut group = ProcessGroup::launch(
            &topology,
            &proc_output,
            &ready,
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        wait_until_exited(&mut group);
        let info = group.shutdown(Duration::from_secs(5));

        assert_eq!(info.get(&dut).map(|e| e.returncode), Some(4));
        let texts = proc_output.capture(&dut).unwrap().texts();
        assert!(texts.contains(&"hello".to_string()));
        assert!(texts.contains(&"oops".to_string()));
    }

    #[test]
    fn test_shutdown_interrupts_long_running_process() {
        let mut topology = Topology::new();
        let sleeper = topology.add_process(sh("sleeper", "echo up; sleep 30"));
        let proc_output = ProcOutput::new();
        let (ready, _waiter) = ready_channel();

        let mut group = ProcessGroup::launch(
            &topology,
            &proc_output,
            &ready,
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(group.status(&sleeper), ProcessStatus::Running { .. }));

        let started = Instant::now();
        let info = group.shutdown(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(info.get(&sleeper).is_some());
        assert!(matches!(group.status(&sleeper), ProcessStatus::Exited { .. }));
    }

    #[test]
    fn test_extra_env_reaches_process() {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", "echo domain=$DOMAIN_ID").env("LOCAL", "1"));
        let proc_output = ProcOutput::new();
        let (ready, _waiter) = ready_channel();
        let env = BTreeMap::from([("DOMAIN_ID".to_string(), "42".to_string())]);

        let mut group =
            ProcessGroup::launch(&topology, &proc_output, &ready, &env, Duration::from_secs(5))
                .unwrap();
        wait_until_exited(&mut group);
        group.shutdown(Duration::from_secs(5));

        let texts = proc_output.capture(&dut).unwrap().texts();
        assert_eq!(texts, vec!["domain=42".to_string()]);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let mut topology = Topology::new();
        topology.add_process(ProcessSpec::new("ghost", ["/nonexistent/launchtest-binary"]));
        let proc_output = ProcOutput::new();
        let (ready, _waiter) = ready_channel();

        let err = ProcessGroup::launch(
            &topology,
            &proc_output,
            &ready,
            &BTreeMap::new(),
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LaunchError::Spawn { ref name, .. } if name == "ghost"));
    }
}

//! The supervisor: process table, spawn/respawn policy, signal-driven state
//! machine and control-message fan-out.

pub mod process;
pub mod signal;

use crate::channel::{self, ChannelPair};
use crate::config::Config;
use crate::logging::{self, Logger};
use crate::master::process::{ProcessTable, RespawnPolicy};
use crate::message::Record;
use crate::net::socket::Protocol;
use crate::server::Server;
use crate::status::{Result, Status};
use crate::task::Handler;
use crate::worker::{Worker, WorkerEnv};
use crate::MAX_PROCESS;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};
use std::fs;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

const MASTER_TITLE_SUFFIX: &str = " - master process";
const WORKER_TITLE_SUFFIX: &str = " - worker process";

/// Upper bound on descriptors remapped across exec (channel + listeners).
const MAX_INHERITED_FDS: usize = 16;

/// First graceful-shutdown delay; doubles on every SIGALRM.
const INITIAL_SHUTDOWN_DELAY_MS: u64 = 50;

/// Past this delay the shutdown ladder escalates to SIGKILL.
const KILL_THRESHOLD_MS: u64 = 1000;

/// Pause between spawning a replacement cohort and terminating the old one,
/// so the newcomers can drain their OPEN fan-out first.
const RELOAD_SETTLE_MS: u64 = 100;

pub struct Master<H: Handler> {
    title: String,
    pid: Pid,
    pid_path: PathBuf,
    worker_num: u32,

    delay: u64,
    sigio: u32,
    live: bool,
    terminate: bool,
    quit: bool,

    table: ProcessTable,
    server: Server<H>,
    config: Config,
    log: Logger,
}

impl<H: Handler> Master<H> {
    pub fn new(title: &str, server: Server<H>, config: Config, log: &Logger) -> Master<H> {
        let worker_num = config.worker_num;
        let pid_path = config.pid_path.clone();

        Master {
            title: title.to_owned(),
            pid: getpid(),
            pid_path,
            worker_num,
            delay: 0,
            sigio: 0,
            live: false,
            terminate: false,
            quit: false,
            table: ProcessTable::new(),
            server,
            config,
            log: log.new(logging::o!("role" => "master")),
        }
    }

    #[inline]
    pub fn server_mut(&mut self) -> &mut Server<H> {
        &mut self.server
    }

    /// Validates the configuration surface, names the process and prepares
    /// the server's listeners. Fails fast before anything is spawned. In a
    /// worker process the listeners are inherited rather than bound, so
    /// only the validation and the title apply.
    pub fn prepare_start(&mut self) -> Result<()> {
        let host = self
            .config
            .host
            .clone()
            .ok_or_else(|| Status::io_error("prepare start", "host is not configured"))?;
        let port = self
            .config
            .port
            .ok_or_else(|| Status::io_error("prepare start", "port is not configured"))?;

        if WorkerEnv::capture().is_some() {
            self.config.set_proc_title(&format!("{}{}", self.title, WORKER_TITLE_SUFFIX))?;
            return Ok(());
        }

        self.config.set_proc_title(&format!("{}{}", self.title, MASTER_TITLE_SUFFIX))?;

        let protocol = self.config.protocol.clone();
        self.server.prepare_start(&host, port, &protocol)
    }

    /// Single-process mode: pid file, signal handlers, then the server's
    /// own main loop.
    pub fn single_start(&mut self) -> Result<()> {
        self.create_pid_file()?;
        signal::install()?;
        self.server.single_start()
    }

    /// Supervision mode. In the parent: pid file, signal handlers, process
    /// table, one respawnable worker per configured slot, then the
    /// signal-driven state machine forever. In a process that was itself
    /// spawned as a worker, this transparently runs the worker loop
    /// instead, so callers use one entry point for both roles.
    pub fn master_start(&mut self) -> Result<()> {
        if let Some(env) = WorkerEnv::capture() {
            let status = match Worker::adopt(env, &self.log) {
                Ok(mut worker) => {
                    let adopted = Protocol::from_name(&self.config.protocol)
                        .ok_or_else(|| {
                            Status::not_supported(
                                "worker start",
                                format!("protocol {}", self.config.protocol),
                            )
                        })
                        .and_then(|protocol| self.server.adopt_listeners(env.listener_fds(), protocol));

                    match adopted {
                        Ok(()) => self.server.worker_start(&mut worker),
                        Err(status) => Err(status),
                    }
                }
                Err(status) => Err(status),
            };
            // The loop only returns on setup failure. Status 2 tells the
            // supervisor not to respawn a worker that cannot start.
            if let Err(status) = status {
                logging::error!(self.log, "worker failed to start";
                                "context" => "master_start",
                                "status" => status.to_string());
                std::process::exit(2);
            }
            return Ok(());
        }

        if self.worker_num as usize > MAX_PROCESS {
            return Err(Status::io_error("master start", "worker number overflows process table"));
        }

        self.create_pid_file()?;
        signal::install()?;
        signal::block()?;

        self.start_workers(self.worker_num, RespawnPolicy::Respawn)?;
        self.live = true;

        logging::info!(self.log, "supervising";
                       "context" => "master_start",
                       "workers" => self.worker_num);

        loop {
            if let Err(status) = self.handle_signal() {
                logging::error!(self.log, "signal cycle failed";
                                "context" => "master_start",
                                "status" => status.to_string());
            }
        }
    }

    /// Sends a named control signal to the instance recorded in the pid
    /// file.
    pub fn signal_process(&self, name: &str) -> Result<()> {
        let signo = signal::signal_by_name(name)
            .ok_or_else(|| Status::invalid_argument("signal process", format!("unknown signal {}", name)))?;

        let text = fs::read_to_string(&self.pid_path)
            .map_err(|err| Status::io_error("signal process", err.to_string()))?;
        let pid: i32 = text
            .trim()
            .parse()
            .map_err(|_| Status::corruption("signal process", "pid file is not a pid"))?;
        if pid <= 0 {
            return Err(Status::corruption("signal process", "pid file holds a non-positive pid"));
        }

        kill(Pid::from_raw(pid), signo)?;
        Ok(())
    }

    /// Spawns `count` workers under one policy and announces each newcomer
    /// to the rest of the pool. Also usable for standalone `Detached`
    /// processes, which skip the fan-out on the receiving side.
    pub fn start_workers(&mut self, count: u32, policy: RespawnPolicy) -> Result<()> {
        for _ in 0..count {
            let slot = self.spawn_worker(None, policy)?;
            self.pass_open_channel(slot);
        }
        Ok(())
    }

    /// Creates the channel pair, spawns the worker process with the peer
    /// end on the well-known descriptor and updates the table. An explicit
    /// slot is a respawn and keeps the slot's policy flags.
    fn spawn_worker(&mut self, explicit: Option<usize>, policy: RespawnPolicy) -> Result<usize> {
        let slot = self.table.allocate(explicit)?;

        {
            let entry = self.table.entry_mut(slot);
            entry.channel.close();
            entry.channel = ChannelPair::open()?;
        }

        if let Err(status) = channel::set_async_owner(self.table.entry(slot).channel.local_fd(), self.pid)
        {
            self.table.entry_mut(slot).channel.close();
            return Err(status);
        }

        let peer_fd = self.table.entry(slot).channel.peer_fd();
        let listen_fds = self.server.listener_fds();
        if 1 + listen_fds.len() > MAX_INHERITED_FDS {
            return Err(Status::invalid_argument("spawn worker", "too many inherited descriptors"));
        }

        // Channel first, listeners after, on consecutive well-known slots.
        let mut sources = [-1 as RawFd; MAX_INHERITED_FDS];
        sources[0] = peer_fd;
        for (index, fd) in listen_fds.iter().enumerate() {
            sources[1 + index] = *fd;
        }
        let source_count = 1 + listen_fds.len();

        let exe = std::env::current_exe()
            .map_err(|err| Status::io_error("spawn worker", err.to_string()))?;

        let mut command = Command::new(exe);
        command.args(std::env::args_os().skip(1));
        for (key, value) in WorkerEnv::export(slot, self.worker_num, listen_fds.len()) {
            command.env(key, value);
        }

        unsafe {
            command.pre_exec(move || {
                // Hop through high descriptors first so remapping cannot
                // clobber a source that already sits on a target slot.
                // dup2 onto the target clears close-on-exec.
                let mut temps = [-1 as RawFd; MAX_INHERITED_FDS];
                for index in 0..source_count {
                    let temp = nix::libc::fcntl(sources[index], nix::libc::F_DUPFD, 64);
                    if temp == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    temps[index] = temp;
                }
                for index in 0..source_count {
                    let target = crate::CHANNEL_FD + index as RawFd;
                    if nix::libc::dup2(temps[index], target) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    nix::libc::close(temps[index]);
                }
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.table.entry_mut(slot).channel.close();
                return Err(Status::io_error("spawn worker", err.to_string()));
            }
        };

        let pid = child.id() as i32;
        // Reaped through waitpid in the signal loop, not through the handle.
        drop(child);

        let entry = self.table.entry_mut(slot);
        match explicit {
            Some(_) => entry.reactivate(pid),
            None => entry.activate(pid, policy),
        }

        logging::info!(self.log, "worker spawned";
                       "context" => "spawn_worker",
                       "slot" => slot,
                       "pid" => pid);
        Ok(slot)
    }

    /// Announces a (re)spawned worker's channel to every other live,
    /// non-detached worker; the kernel delivers the descriptor itself.
    fn pass_open_channel(&self, slot: usize) {
        let entry = self.table.entry(slot);
        let frame = Record::Open {
            slot: slot as u32,
            pid: entry.pid,
            fd: entry.channel.local_fd(),
        }
        .encode();

        for other in self.table.iter() {
            if other.slot == slot || !other.occupied() || other.detached {
                continue;
            }
            if let Err(status) = other.channel.send(&frame, &self.log) {
                // A recipient that cannot take the message is assumed dying.
                logging::debug!(self.log, "open fan-out failed";
                                "context" => "pass_open_channel",
                                "to_slot" => other.slot,
                                "status" => status.to_string());
            }
        }
    }

    /// Tells every live worker to drop its descriptor for a dead slot.
    fn pass_close_channel(&self, slot: usize, pid: i32) {
        let frame = Record::Close { slot: slot as u32, pid }.encode();

        for other in self.table.iter() {
            if !other.occupied() || other.exited || other.detached {
                continue;
            }
            if let Err(status) = other.channel.send(&frame, &self.log) {
                logging::debug!(self.log, "close fan-out failed";
                                "context" => "pass_close_channel",
                                "to_slot" => other.slot,
                                "status" => status.to_string());
            }
        }
    }

    /// Delivers a shutdown-class signal to every eligible worker, on the
    /// channel where possible, by `kill` otherwise. `just_spawn` workers
    /// sit out exactly one cycle.
    fn signal_worker(&mut self, signo: Signal) {
        let frame = match signo {
            Signal::SIGQUIT => Some(Record::Quit.encode()),
            Signal::SIGTERM => Some(Record::Terminate.encode()),
            _ => None,
        };

        let mut reap_pending = false;

        for slot in 0..MAX_PROCESS {
            let entry = self.table.entry_mut(slot);
            if !entry.occupied() || entry.detached {
                continue;
            }
            if entry.just_spawn {
                entry.just_spawn = false;
                continue;
            }
            if entry.exiting && signo == Signal::SIGQUIT {
                continue;
            }

            if let Some(frame) = &frame {
                if entry.channel.send(frame, &self.log).is_ok() {
                    entry.exiting = true;
                    continue;
                }
                // Fall back to the signal for workers that cannot receive.
            }

            match kill(Pid::from_raw(entry.pid), signo) {
                Ok(()) => {
                    if signo != Signal::SIGUSR1 {
                        entry.exiting = true;
                    }
                }
                Err(Errno::ESRCH) => {
                    entry.exited = true;
                    entry.exiting = false;
                    reap_pending = true;
                }
                Err(errno) => {
                    logging::debug!(self.log, "kill failed";
                                    "context" => "signal_worker",
                                    "slot" => slot,
                                    "errno" => errno.desc());
                }
            }
        }

        if reap_pending {
            signal::raise(signal::FLAG_REAP);
        }
    }

    /// Collects exit statuses of all pending children. Exit code 2 revokes
    /// the slot's respawn policy.
    fn worker_exit_stat(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    logging::info!(self.log, "worker exited";
                                   "context" => "worker_exit_stat",
                                   "pid" => pid.as_raw(),
                                   "code" => code);
                    if let Some(entry) = self.table.find_pid(pid.as_raw()) {
                        entry.stat = code;
                        entry.exited = true;
                        if code == 2 && entry.respawn {
                            entry.respawn = false;
                        }
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, core)) => {
                    logging::error!(self.log, "worker killed by signal";
                                    "context" => "worker_exit_stat",
                                    "pid" => pid.as_raw(),
                                    "signal" => sig.as_str(),
                                    "core_dumped" => core);
                    if let Some(entry) = self.table.find_pid(pid.as_raw()) {
                        entry.stat = 128 + sig as i32;
                        entry.exited = true;
                    }
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    logging::error!(self.log, "waitpid failed";
                                    "context" => "worker_exit_stat",
                                    "errno" => errno.desc());
                    break;
                }
            }
        }
    }

    /// Reconciles exited slots: close fan-out, channel teardown, respawn
    /// where policy allows, and recompute whether anyone is left alive.
    fn reap_children(&mut self) {
        self.live = false;

        for slot in 0..MAX_PROCESS {
            let (occupied, exited, exiting, detached, respawn, pid) = {
                let entry = self.table.entry(slot);
                (entry.occupied(), entry.exited, entry.exiting, entry.detached, entry.respawn, entry.pid)
            };

            if !occupied {
                continue;
            }

            if exited {
                if !detached {
                    self.pass_close_channel(slot, pid);
                    self.table.entry_mut(slot).channel.close();
                }

                if respawn && !exiting && !self.terminate && !self.quit {
                    match self.spawn_worker(Some(slot), RespawnPolicy::Respawn) {
                        Ok(_) => {
                            self.pass_open_channel(slot);
                            self.live = true;
                        }
                        Err(status) => {
                            logging::error!(self.log, "respawn failed";
                                            "context" => "reap_children",
                                            "slot" => slot,
                                            "status" => status.to_string());
                        }
                    }
                    continue;
                }

                self.table.entry_mut(slot).release();
            } else if exiting || !detached {
                self.live = true;
            }
        }
    }

    /// One turn of the supervisor state machine: arm the backoff timer,
    /// wait for a signal, then act on the coalesced flags.
    fn handle_signal(&mut self) -> Result<()> {
        if self.delay != 0 {
            if signal::take(signal::FLAG_ALARM) {
                self.sigio = 0;
                self.delay *= 2;
            }
            signal::arm_timer(self.delay)?;
        }

        signal::suspend();

        // SIGIO only wakes the loop so fresh channel traffic is observed.
        signal::take(signal::FLAG_IO);

        if signal::take(signal::FLAG_REAP) {
            self.worker_exit_stat();
            self.reap_children();
        }

        if signal::take(signal::FLAG_TERMINATE) {
            self.terminate = true;
        }
        if signal::take(signal::FLAG_QUIT) {
            self.quit = true;
        }

        if !self.live && (self.terminate || self.quit) {
            self.master_exit();
        }

        if self.terminate {
            if self.delay == 0 {
                self.delay = INITIAL_SHUTDOWN_DELAY_MS;
            }
            if self.sigio > 0 {
                self.sigio -= 1;
                return Ok(());
            }
            self.sigio = self.worker_num;

            if self.delay > KILL_THRESHOLD_MS {
                self.signal_worker(Signal::SIGKILL);
            } else {
                self.signal_worker(Signal::SIGTERM);
            }
            return Ok(());
        }

        if self.quit {
            self.signal_worker(Signal::SIGQUIT);
            return Ok(());
        }

        if signal::take(signal::FLAG_RECONFIGURE) {
            if let Err(status) = self.config.reload() {
                logging::error!(self.log, "configuration reload failed, keeping previous";
                                "context" => "handle_signal",
                                "status" => status.to_string());
            }

            self.start_workers(self.worker_num, RespawnPolicy::JustRespawn)?;
            // Let the replacement cohort settle before the old one is told
            // to leave, so its OPEN fan-out is not reordered after
            // TERMINATE.
            thread::sleep(Duration::from_millis(RELOAD_SETTLE_MS));
            self.live = true;
            self.signal_worker(Signal::SIGTERM);
        }

        if signal::take(signal::FLAG_REOPEN) {
            self.signal_worker(Signal::SIGUSR1);
        }

        Ok(())
    }

    fn master_exit(&mut self) -> ! {
        self.delete_pid_file();
        fs::remove_file(&self.config.lock_path).ok();

        logging::info!(self.log, "all workers gone, supervisor exiting";
                       "context" => "master_exit");
        std::process::exit(0)
    }

    fn create_pid_file(&self) -> Result<()> {
        if let Some(parent) = self.pid_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(&self.pid_path, format!("{}\n", self.pid))
            .map_err(|err| Status::io_error("pid file create", err.to_string()))
    }

    fn delete_pid_file(&self) {
        fs::remove_file(&self.pid_path).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    struct NullHandler;

    impl Handler for NullHandler {
        fn on_message(&mut self, _task: &mut Task, _proto: u8, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_master(config: Config) -> Master<NullHandler> {
        let log = logging::discard();
        let server = Server::new(&config, NullHandler, &log).unwrap();
        Master::new("hearth-test", server, config, &log)
    }

    fn temp_config(dir: &tempfile::TempDir) -> Config {
        Config::from_toml_str(&format!(
            "pid_path = \"{}\"\nlock_path = \"{}\"\n",
            dir.path().join("test.pid").display(),
            dir.path().join("test.lock").display(),
        ))
        .unwrap()
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_master(temp_config(&dir));

        master.create_pid_file().unwrap();
        let text = fs::read_to_string(&master.pid_path).unwrap();
        assert_eq!(text.trim().parse::<i32>().unwrap(), getpid().as_raw());

        master.delete_pid_file();
        assert!(!master.pid_path.exists());
    }

    #[test]
    fn test_prepare_start_requires_host_and_port() {
        let dir = tempfile::tempdir().unwrap();

        let mut master = test_master(temp_config(&dir));
        assert!(master.prepare_start().is_err());

        let mut config = temp_config(&dir);
        config.host = Some("127.0.0.1".to_owned());
        let mut master = test_master(config);
        assert!(master.prepare_start().is_err());

        let mut config = temp_config(&dir);
        config.host = Some("127.0.0.1".to_owned());
        config.port = Some(0);
        let mut master = test_master(config);
        master.prepare_start().unwrap();
    }

    #[test]
    fn test_signal_process_error_paths() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_master(temp_config(&dir));

        // Unknown command name.
        assert!(master.signal_process("restart").is_err());
        // No pid file yet.
        assert!(master.signal_process("stop").is_err());

        // Garbage pid file.
        fs::write(&master.pid_path, "not a pid\n").unwrap();
        assert!(master.signal_process("stop").is_err());

        fs::write(&master.pid_path, "-4\n").unwrap();
        assert!(master.signal_process("stop").is_err());
    }

    #[test]
    fn test_reap_releases_non_respawn_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));

        // A fake exited worker with no respawn policy.
        let slot = master.table.allocate(None).unwrap();
        {
            let entry = master.table.entry_mut(slot);
            entry.activate(999_999, RespawnPolicy::NoRespawn);
            entry.channel = ChannelPair::open().unwrap();
            entry.exited = true;
        }

        master.reap_children();

        let entry = master.table.entry(slot);
        assert!(!entry.occupied());
        assert!(!entry.channel.is_open());
        assert!(!master.live);
    }

    #[test]
    fn test_reap_counts_survivors_as_live() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));

        let slot = master.table.allocate(None).unwrap();
        master.table.entry_mut(slot).activate(999_998, RespawnPolicy::Respawn);

        master.reap_children();
        assert!(master.live);
    }

    #[test]
    fn test_shutdown_suppresses_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));
        master.terminate = true;

        let slot = master.table.allocate(None).unwrap();
        {
            let entry = master.table.entry_mut(slot);
            entry.activate(999_997, RespawnPolicy::Respawn);
            entry.exited = true;
        }

        // Respawn policy is set, but a pending shutdown wins.
        master.reap_children();
        assert!(!master.table.entry(slot).occupied());
    }

    #[test]
    fn test_close_fanout_reaches_live_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));

        // Survivor worker with a live channel we can observe.
        let survivor = master.table.allocate(None).unwrap();
        {
            let entry = master.table.entry_mut(survivor);
            entry.activate(999_996, RespawnPolicy::Respawn);
            entry.channel = ChannelPair::open().unwrap();
        }

        master.pass_close_channel(7, 4242);

        let mut buf = [0u8; 64];
        let received = crate::channel::recv_bytes(
            master.table.entry(survivor).channel.peer_fd(),
            &mut buf,
            &logging::discard(),
        )
        .unwrap();

        let (_, envelope) = crate::message::peek(&buf[..received]).unwrap().unwrap();
        match Record::decode(envelope.payload).unwrap() {
            Record::Close { slot, pid } => {
                assert_eq!(slot, 7);
                assert_eq!(pid, 4242);
            }
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn test_signal_worker_skips_just_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));

        let slot = master.table.allocate(None).unwrap();
        {
            let entry = master.table.entry_mut(slot);
            entry.activate(999_995, RespawnPolicy::JustRespawn);
            entry.channel = ChannelPair::open().unwrap();
        }

        // First cycle: the fresh worker is spared and unmarked.
        master.signal_worker(Signal::SIGTERM);
        {
            let entry = master.table.entry(slot);
            assert!(!entry.exiting);
            assert!(!entry.just_spawn);
        }

        // Second cycle: the TERMINATE record goes through on the channel.
        master.signal_worker(Signal::SIGTERM);
        let entry = master.table.entry(slot);
        assert!(entry.exiting);

        let mut buf = [0u8; 64];
        let received =
            crate::channel::recv_bytes(entry.channel.peer_fd(), &mut buf, &logging::discard())
                .unwrap();
        let (_, envelope) = crate::message::peek(&buf[..received]).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Terminate);
    }

    #[test]
    fn test_signal_worker_marks_vanished_for_reap() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = test_master(temp_config(&dir));

        // A worker with no channel and a pid that cannot exist.
        let slot = master.table.allocate(None).unwrap();
        master.table.entry_mut(slot).activate(i32::max_value() - 1, RespawnPolicy::Respawn);

        master.signal_worker(Signal::SIGTERM);

        let entry = master.table.entry(slot);
        assert!(entry.exited);
        assert!(signal::take(signal::FLAG_REAP));
    }
}

//! The worker-side event engine: bounded-wait readiness loop, sharded task
//! pool, accept-turn bracket, heartbeat scheduling and the graceful exit
//! path. The same engine also backs single-process mode.

pub mod accept;
pub mod pool;

use crate::config::Config;
use crate::logging::{self, Logger};
use crate::master::signal;
use crate::message::Record;
use crate::net::socket::{Protocol, Socket, SocketState};
use crate::server::accept::AcceptToken;
use crate::server::pool::{Shard, TaskPool};
use crate::status::{Result, Status, StatusUtils};
use crate::task::{Handler, Task, TaskEvent};
use crate::worker::Worker;
use crate::NUM_SHARDS;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const EVENTS_CAPACITY: usize = 512;

/// Notifier wait bound; keeps the heartbeat clock responsive.
const POLL_TIMEOUT_MS: u64 = 10;

/// Heartbeat clock granularity in microseconds.
const TICK_USEC: u64 = 10_000;

#[derive(Copy, Clone)]
struct EventSnapshot {
    fd: RawFd,
    readable: bool,
    writable: bool,
    error: bool,
}

/// Handle to the optional scheduler thread running heartbeat sweeps off the
/// readiness loop. The try-locked mutex plus the `ok` latch guarantee ticks
/// never queue up behind a slow sweep.
struct Scheduler {
    tx: mpsc::Sender<u64>,
    ok: Arc<AtomicBool>,
    mutex: Arc<Mutex<()>>,
}

pub struct Server<H: Handler> {
    handler: H,
    poll: Poll,
    registry: Registry,
    events: Events,
    scratch: Vec<EventSnapshot>,
    pool: Arc<TaskPool>,

    pending_listeners: Vec<Socket>,
    listen_fds: Vec<RawFd>,
    bound_addrs: Vec<SocketAddr>,

    accept_token: Option<AcceptToken>,
    accept_held: bool,
    use_accept_turn: bool,
    lock_path: PathBuf,

    heartbeat_turn: bool,
    schedule_turn: bool,
    keep_alive_ms: u64,
    keep_alive_cnt: u8,
    scheduler: Option<Scheduler>,

    timeout: Duration,
    clock: Instant,
    latest_tm: u64,

    exiting: bool,
    exit_code: i32,

    log: Logger,
}

impl<H: Handler> Server<H> {
    pub fn new(config: &Config, handler: H, log: &Logger) -> Result<Server<H>> {
        let poll = Poll::new().map_err(|err| Status::io_error("poll create", err.to_string()))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|err| Status::io_error("poll create", err.to_string()))?;

        Ok(Server {
            handler,
            poll,
            registry,
            events: Events::with_capacity(EVENTS_CAPACITY),
            scratch: Vec::with_capacity(EVENTS_CAPACITY),
            pool: Arc::new(TaskPool::new()),
            pending_listeners: Vec::new(),
            listen_fds: Vec::new(),
            bound_addrs: Vec::new(),
            accept_token: None,
            accept_held: false,
            use_accept_turn: config.accept_turn,
            lock_path: config.lock_path.clone(),
            heartbeat_turn: config.heartbeat_turn,
            schedule_turn: config.schedule_turn,
            keep_alive_ms: config.keep_alive_ms,
            keep_alive_cnt: config.keep_alive_cnt,
            scheduler: None,
            timeout: Duration::from_millis(POLL_TIMEOUT_MS),
            clock: Instant::now(),
            latest_tm: 0,
            exiting: false,
            exit_code: 0,
            log: log.new(logging::o!()),
        })
    }

    /// Creates the listening socket for the configured protocol. Called by
    /// the supervisor before any worker exists so every worker inherits the
    /// same bound socket configuration.
    pub fn prepare_start(&mut self, host: &str, port: u16, protocol: &str) -> Result<()> {
        let protocol = Protocol::from_name(protocol)
            .ok_or_else(|| Status::not_supported("prepare start", format!("protocol {}", protocol)))?;

        let socket = Socket::listen(protocol, host, port)?;
        logging::info!(self.log, "listener ready";
                       "context" => "prepare_start",
                       "address" => socket.peer().to_owned());

        self.pending_listeners.push(socket);
        Ok(())
    }

    /// Descriptors of the listeners created by `prepare_start`, in order.
    /// The supervisor passes them to every spawned worker.
    pub fn listener_fds(&self) -> Vec<RawFd> {
        self.pending_listeners.iter().map(|socket| socket.raw_fd()).collect()
    }

    /// Adopts listening sockets inherited across exec, in place of binding
    /// fresh ones. The descriptors are re-flagged close-on-exec so only
    /// deliberately spawned processes ever see them.
    pub fn adopt_listeners<I: IntoIterator<Item = RawFd>>(
        &mut self,
        fds: I,
        protocol: Protocol,
    ) -> Result<()> {
        for fd in fds {
            nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))?;
            let socket = Socket::from_inherited(fd, protocol)?;
            self.pending_listeners.push(socket);
        }
        Ok(())
    }

    /// Addresses actually bound, available once listeners are installed.
    pub fn bound_addrs(&self) -> &[SocketAddr] {
        &self.bound_addrs
    }

    #[inline]
    pub fn exiting(&self) -> bool {
        self.exiting
    }

    #[inline]
    fn now_usec(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }

    /// Single-process mode: no supervisor, no accept turns, signals arrive
    /// directly. Never returns except through `process::exit`.
    pub fn single_start(&mut self) -> Result<()> {
        self.use_accept_turn = false;
        self.install_listeners(true)?;

        loop {
            if self.exiting {
                self.graceful_exit();
            }
            self.recv(&mut None);
            self.handle_signal();
            self.check_tick();
        }
    }

    /// Worker mode: adopt the inherited channel, arbitrate accepts through
    /// the token when siblings exist, serve until told to exit.
    pub fn worker_start(&mut self, worker: &mut Worker) -> Result<()> {
        if self.use_accept_turn && worker.worker_num() > 1 {
            self.accept_token = Some(AcceptToken::new(&self.lock_path)?);
            // Listeners join the pool but stay unregistered; the token
            // holder registers them for the duration of its turn.
            self.install_listeners(false)?;
        } else {
            self.use_accept_turn = false;
            self.install_listeners(true)?;
        }

        let channel_task = Task::new(
            Socket::channel(worker.channel_fd()),
            pool::shard_of(worker.channel_fd()),
            Some(&self.log),
        );
        self.register_and_insert(channel_task)?;

        if self.schedule_turn && self.heartbeat_turn {
            self.spawn_scheduler();
        }

        let mut worker = Some(worker);
        loop {
            if self.exiting {
                self.graceful_exit();
            }
            self.recv(&mut worker);
            self.check_tick();
            self.handle_signal();
        }
    }

    /// One bounded readiness wait plus dispatch, bracketed by the accept
    /// turn. Internal failures are logged, not propagated; the loop must
    /// outlive any single descriptor.
    fn recv(&mut self, worker: &mut Option<&mut Worker>) {
        if self.use_accept_turn && !self.accept_held {
            let acquired = match self.accept_token.as_mut() {
                Some(token) => token.try_acquire(),
                None => false,
            };
            if acquired {
                self.register_listeners();
                self.accept_held = true;
            }
        }

        match self.poll.poll(&mut self.events, Some(self.timeout)) {
            Ok(()) => (),
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => (),
            Err(err) => {
                logging::error!(self.log, "readiness wait failed";
                                "context" => "recv",
                                "error" => err.to_string());
            }
        }

        self.scratch.clear();
        for event in self.events.iter() {
            self.scratch.push(EventSnapshot {
                fd: event.token().0 as RawFd,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error() || event.is_priority(),
            });
        }

        for index in 0..self.scratch.len() {
            let snap = self.scratch[index];
            self.dispatch_event(snap, worker);
        }

        if self.use_accept_turn && self.accept_held {
            self.deregister_listeners();
            self.accept_held = false;
            if let Some(token) = self.accept_token.as_mut() {
                token.release();
            }
        }
    }

    fn dispatch_event(&mut self, snap: EventSnapshot, worker: &mut Option<&mut Worker>) {
        let now = self.now_usec();
        let pool = Arc::clone(&self.pool);

        let mut do_accept = false;
        let mut channel_down = false;
        let mut controls: Vec<Record> = Vec::new();

        {
            let mut shard = pool.lock(pool::shard_of(snap.fd));
            let task = match shard.get_mut(&snap.fd) {
                Some(task) => task,
                None => {
                    // Stale notification for a descriptor no task owns.
                    drop(shard);
                    self.deregister_raw(snap.fd);
                    return;
                }
            };

            if snap.error {
                evict_locked(&self.registry, &mut shard, snap.fd, &self.log);
            } else if task.socket().state() == SocketState::Listening {
                if snap.readable {
                    do_accept = true;
                } else {
                    logging::error!(self.log, "unexpected event on listening socket";
                                    "context" => "dispatch",
                                    "fd" => snap.fd);
                }
            } else {
                let protocol = task.socket().protocol();
                let mut evict = false;

                if snap.readable {
                    match task.recv(now) {
                        Ok(events) => {
                            for event in events {
                                match event {
                                    TaskEvent::Control(record) => controls.push(record),
                                    TaskEvent::Message { proto, payload } => {
                                        if self.handler.on_message(task, proto, &payload).has_failed()
                                        {
                                            evict = true;
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                        Err(status) if !status.is_again() => {
                            if protocol == Protocol::Channel {
                                logging::info!(self.log, "control channel lost";
                                               "context" => "dispatch",
                                               "status" => status.to_string());
                                channel_down = true;
                                evict = true;
                            } else if protocol != Protocol::Udp {
                                logging::debug!(self.log, "task receive failed";
                                                "context" => "dispatch",
                                                "fd" => snap.fd,
                                                "status" => status.to_string());
                                evict = true;
                            }
                        }
                        Err(_) => (),
                    }
                }

                if !evict && snap.writable {
                    if task.send_len() == 0 {
                        // Nothing pending, stop watching for writability.
                        task.socket_mut()
                            .reregister(&self.registry, Token(snap.fd as usize), Interest::READABLE)
                            .ok();
                    } else {
                        match task.send(now) {
                            Ok(_) => {
                                if task.send_len() == 0 {
                                    task.socket_mut()
                                        .reregister(
                                            &self.registry,
                                            Token(snap.fd as usize),
                                            Interest::READABLE,
                                        )
                                        .ok();
                                }
                            }
                            Err(status) if !status.is_again() && protocol != Protocol::Udp => {
                                logging::error!(self.log, "task send failed";
                                                "context" => "dispatch",
                                                "fd" => snap.fd,
                                                "status" => status.to_string());
                                evict = true;
                            }
                            Err(_) => (),
                        }
                    }
                }

                if !evict && task.take_wants_write() {
                    task.socket_mut()
                        .reregister(
                            &self.registry,
                            Token(snap.fd as usize),
                            Interest::READABLE | Interest::WRITABLE,
                        )
                        .ok();
                }

                if evict {
                    evict_locked(&self.registry, &mut shard, snap.fd, &self.log);
                }
            }
        }

        if do_accept {
            self.accept_conn(snap.fd);
        }

        for record in controls {
            self.apply_control(record, worker);
        }

        if channel_down && !self.exiting {
            // Losing the supervisor is an orderly reason to go.
            self.exiting = true;
            self.exit_code = 0;
        }
    }

    /// Drains the accept queue of one listener: decorate, register, file
    /// into the pool, then run the application hello. Any failure along the
    /// chain evicts the newcomer.
    fn accept_conn(&mut self, listener_fd: RawFd) {
        let pool = Arc::clone(&self.pool);

        loop {
            let accepted = {
                let mut shard = pool.lock(pool::shard_of(listener_fd));
                match shard.get_mut(&listener_fd) {
                    Some(task) => match task.socket_mut().accept() {
                        Ok(Some(socket)) => Some(socket),
                        Ok(None) => None,
                        Err(status) => {
                            if !status.is_again() {
                                logging::error!(self.log, "accept failed";
                                                "context" => "accept_conn",
                                                "fd" => listener_fd,
                                                "status" => status.to_string());
                            }
                            None
                        }
                    },
                    None => None,
                }
            };

            let socket = match accepted {
                Some(socket) => socket,
                None => break,
            };

            let fd = socket.raw_fd();
            let peer = socket.peer().to_owned();
            let mut task = Task::new(socket, pool::shard_of(fd), Some(&self.log));

            if let Err(err) =
                task.socket_mut().register(&self.registry, Token(fd as usize), Interest::READABLE)
            {
                logging::error!(self.log, "registration of accepted connection failed";
                                "context" => "accept_conn",
                                "fd" => fd,
                                "error" => err.to_string());
                continue;
            }

            logging::debug!(self.log, "connection admitted";
                            "context" => "accept_conn",
                            "fd" => fd,
                            "peer" => peer);
            self.pool.insert(task);

            // Application-level hello runs under the task's shard lock.
            let mut shard = pool.lock(pool::shard_of(fd));
            if let Some(task) = shard.get_mut(&fd) {
                if self.handler.on_open(task).has_failed() {
                    evict_locked(&self.registry, &mut shard, fd, &self.log);
                } else if task.take_wants_write() {
                    task.socket_mut()
                        .reregister(
                            &self.registry,
                            Token(fd as usize),
                            Interest::READABLE | Interest::WRITABLE,
                        )
                        .ok();
                }
            }
        }
    }

    fn apply_control(&mut self, record: Record, worker: &mut Option<&mut Worker>) {
        match record {
            Record::Open { slot, pid, fd } => {
                logging::debug!(self.log, "peer channel opened";
                                "context" => "apply_control",
                                "peer_slot" => slot,
                                "peer_pid" => pid,
                                "fd" => fd);
                if let Some(worker) = worker.as_deref_mut() {
                    worker.store_peer(slot as usize, fd);
                }
            }
            Record::Close { slot, pid } => {
                logging::debug!(self.log, "peer channel closed";
                                "context" => "apply_control",
                                "peer_slot" => slot,
                                "peer_pid" => pid);
                if let Some(worker) = worker.as_deref_mut() {
                    worker.close_peer(slot as usize);
                }
            }
            Record::Quit => {
                if !self.exiting {
                    self.exiting = true;
                    self.exit_code = 0;
                }
            }
            Record::Terminate => {
                self.exiting = true;
                self.exit_code = 2;
            }
            record => {
                logging::debug!(self.log, "ignoring control record";
                                "context" => "apply_control",
                                "record" => format!("{:?}", record));
            }
        }
    }

    /// Advances the heartbeat clock in 10 ms ticks and triggers the sweep,
    /// inline or through the scheduler thread.
    fn check_tick(&mut self) {
        let now = self.now_usec();
        let tick = now.saturating_sub(self.latest_tm);
        if tick < TICK_USEC {
            return;
        }
        self.latest_tm += tick;

        if !self.heartbeat_turn {
            return;
        }

        match &self.scheduler {
            Some(scheduler) => {
                // Try-lock so a sweep still in flight delays, not queues,
                // the next one.
                if let Ok(_guard) = scheduler.mutex.try_lock() {
                    if scheduler.ok.swap(false, Ordering::AcqRel) {
                        scheduler.tx.send(now).ok();
                    }
                }
            }
            None => {
                sweep_heartbeat(
                    &self.pool,
                    &self.registry,
                    now,
                    self.keep_alive_ms,
                    self.keep_alive_cnt,
                    &self.log,
                );
            }
        }
    }

    fn spawn_scheduler(&mut self) {
        let registry = match self.registry.try_clone() {
            Ok(registry) => registry,
            Err(err) => {
                logging::error!(self.log, "scheduler thread unavailable, sweeping inline";
                                "context" => "spawn_scheduler",
                                "error" => err.to_string());
                self.schedule_turn = false;
                return;
            }
        };

        let (tx, rx) = mpsc::channel::<u64>();
        let ok = Arc::new(AtomicBool::new(true));
        let mutex = Arc::new(Mutex::new(()));

        let pool = Arc::clone(&self.pool);
        let ok_thread = Arc::clone(&ok);
        let mutex_thread = Arc::clone(&mutex);
        let keep_alive_ms = self.keep_alive_ms;
        let keep_alive_cnt = self.keep_alive_cnt;
        let log = self.log.new(logging::o!("thread" => "scheduler"));

        thread::spawn(move || {
            while let Ok(now) = rx.recv() {
                let _guard = mutex_thread.lock().expect("poisoned schedule mutex");
                sweep_heartbeat(&pool, &registry, now, keep_alive_ms, keep_alive_cnt, &log);
                ok_thread.store(true, Ordering::Release);
            }
        });

        self.scheduler = Some(Scheduler { tx, ok, mutex });
    }

    fn handle_signal(&mut self) {
        if signal::take(signal::FLAG_TERMINATE) {
            self.exiting = true;
            self.exit_code = 2;
        }
        if signal::take(signal::FLAG_QUIT) && !self.exiting {
            self.exiting = true;
            self.exit_code = 0;
        }
        if signal::take(signal::FLAG_REOPEN) {
            self.handler.on_reopen();
        }
    }

    /// Final cleanup and exit. Status 2 tells the supervisor not to respawn
    /// this worker.
    fn graceful_exit(&mut self) -> ! {
        logging::info!(self.log, "exiting";
                       "context" => "graceful_exit",
                       "code" => self.exit_code);

        self.handler.on_exit();
        if let Some(token) = self.accept_token.as_mut() {
            token.destroy();
        }
        self.pool.clear();

        std::process::exit(self.exit_code)
    }

    /// Queues a framed message on one task and raises write interest.
    pub fn send_to(&mut self, fd: RawFd, proto: u8, payload: &[u8]) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        let mut shard = pool.lock(pool::shard_of(fd));
        let task = shard
            .get_mut(&fd)
            .ok_or_else(|| Status::corruption("send", "no task for descriptor"))?;

        task.queue(proto, payload)?;
        if task.take_wants_write() {
            task.socket_mut()
                .reregister(&self.registry, Token(fd as usize), Interest::READABLE | Interest::WRITABLE)
                .ok();
        }
        Ok(())
    }

    /// Queues a framed message on every connected stream task except the
    /// control channel. Per-task failures are logged and skipped.
    pub fn broadcast(&mut self, proto: u8, payload: &[u8]) {
        let pool = Arc::clone(&self.pool);

        for shard_idx in 0..NUM_SHARDS {
            let mut shard = pool.lock(shard_idx);
            let fds: Vec<RawFd> = shard
                .iter()
                .filter(|(_, task)| {
                    task.socket().state() == SocketState::Connected
                        && task.socket().protocol().is_stream()
                })
                .map(|(&fd, _)| fd)
                .collect();

            for fd in fds {
                if let Some(task) = shard.get_mut(&fd) {
                    match task.queue(proto, payload) {
                        Ok(()) => {
                            if task.take_wants_write() {
                                task.socket_mut()
                                    .reregister(
                                        &self.registry,
                                        Token(fd as usize),
                                        Interest::READABLE | Interest::WRITABLE,
                                    )
                                    .ok();
                            }
                        }
                        Err(status) => {
                            logging::debug!(self.log, "broadcast skipped task";
                                            "context" => "broadcast",
                                            "fd" => fd,
                                            "status" => status.to_string());
                        }
                    }
                }
            }
        }
    }

    fn install_listeners(&mut self, register: bool) -> Result<()> {
        let sockets: Vec<Socket> = self.pending_listeners.drain(..).collect();

        for socket in sockets {
            if let Some(addr) = socket.local_addr() {
                self.bound_addrs.push(addr);
            }
            let fd = socket.raw_fd();
            let task = Task::new(socket, pool::shard_of(fd), Some(&self.log));

            if register {
                self.register_and_insert(task)?;
            } else {
                self.pool.insert(task);
            }
            self.listen_fds.push(fd);
        }
        Ok(())
    }

    fn register_and_insert(&mut self, mut task: Task) -> Result<()> {
        let fd = task.socket().raw_fd();
        task.socket_mut()
            .register(&self.registry, Token(fd as usize), Interest::READABLE)
            .map_err(|err| Status::io_error("poll register", err.to_string()))?;
        self.pool.insert(task);
        Ok(())
    }

    /// Adds the listening sockets to the notifier for this accept turn.
    fn register_listeners(&mut self) {
        let fds = self.listen_fds.clone();
        for fd in fds {
            let mut shard = self.pool.lock(pool::shard_of(fd));
            if let Some(task) = shard.get_mut(&fd) {
                task.socket_mut()
                    .register(&self.registry, Token(fd as usize), Interest::READABLE)
                    .ok();
            }
        }
    }

    /// Clears listen-readiness between turns; the tasks stay in the pool.
    fn deregister_listeners(&mut self) {
        let fds = self.listen_fds.clone();
        for fd in fds {
            let mut shard = self.pool.lock(pool::shard_of(fd));
            if let Some(task) = shard.get_mut(&fd) {
                task.socket_mut().deregister(&self.registry).ok();
            }
        }
    }

    fn deregister_raw(&self, fd: RawFd) {
        self.registry.deregister(&mut SourceFd(&fd)).ok();
    }

}

/// Removes a task from its (already locked) shard and the notifier. Closing
/// the descriptor happens exactly once, on drop of the owning task.
fn evict_locked(registry: &Registry, shard: &mut Shard, fd: RawFd, log: &Logger) {
    if let Some(mut task) = shard.swap_remove(&fd) {
        task.socket_mut().deregister(registry).ok();
        logging::debug!(log, "task evicted";
                        "context" => "evict",
                        "fd" => fd,
                        "peer" => task.socket().peer().to_owned());
    }
}

/// One heartbeat sweep over all shards: reclaim dead tasks, probe idle
/// connected stream peers, evict the ones that stopped answering.
fn sweep_heartbeat(
    pool: &TaskPool,
    registry: &Registry,
    now: u64,
    keep_alive_ms: u64,
    keep_alive_cnt: u8,
    log: &Logger,
) {
    let idle_usec = keep_alive_ms * 1000;

    for shard_idx in 0..NUM_SHARDS {
        let mut shard = pool.lock(shard_idx);
        let mut doomed: Vec<RawFd> = Vec::new();

        for (&fd, task) in shard.iter_mut() {
            if !task.socket().protocol().is_stream() {
                continue;
            }

            match task.socket().state() {
                SocketState::Unconnect => doomed.push(fd),
                SocketState::Connected => {
                    if now.saturating_sub(task.socket().send_tm()) >= idle_usec {
                        task.heartbeat_send(now).ok();
                        if task.heartbeat_out(keep_alive_cnt) {
                            doomed.push(fd);
                            continue;
                        }
                        if task.take_wants_write() {
                            task.socket_mut()
                                .reregister(
                                    registry,
                                    Token(fd as usize),
                                    Interest::READABLE | Interest::WRITABLE,
                                )
                                .ok();
                        }
                    }
                }
                SocketState::Listening => (),
            }
        }

        for fd in doomed {
            evict_locked(registry, &mut shard, fd, log);
        }
    }
}

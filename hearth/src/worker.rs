use crate::channel::{self, FD_UNKNOWN};
use crate::logging::{self, Logger};
use crate::master::signal;
use crate::status::{Result, Status};
use hashbrown::HashMap;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::env;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const ENV_SLOT: &str = "HEARTH_WORKER_SLOT";
const ENV_COUNT: &str = "HEARTH_WORKER_COUNT";
const ENV_LISTENERS: &str = "HEARTH_LISTEN_FDS";

/// Spawn parameters a worker recovers from its environment after exec. The
/// channel endpoint sits on `CHANNEL_FD`; `listeners` bound sockets follow
/// on the descriptors directly after it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WorkerEnv {
    pub slot: usize,
    pub worker_num: u32,
    pub listeners: usize,
}

impl WorkerEnv {
    /// Detects whether this process was launched as a worker.
    pub fn capture() -> Option<WorkerEnv> {
        let slot = env::var(ENV_SLOT).ok()?.parse().ok()?;
        let worker_num = env::var(ENV_COUNT).ok()?.parse().ok()?;
        let listeners = env::var(ENV_LISTENERS).ok()?.parse().ok()?;
        Some(WorkerEnv { slot, worker_num, listeners })
    }

    /// Environment a spawn applies to the child.
    pub fn export(slot: usize, worker_num: u32, listeners: usize) -> Vec<(&'static str, String)> {
        vec![
            (ENV_SLOT, slot.to_string()),
            (ENV_COUNT, worker_num.to_string()),
            (ENV_LISTENERS, listeners.to_string()),
        ]
    }

    /// Descriptors the inherited listening sockets occupy in this process.
    pub fn listener_fds(&self) -> impl Iterator<Item = RawFd> {
        let first = crate::CHANNEL_FD + 1;
        (first..first + self.listeners as RawFd).into_iter()
    }
}

/// Worker-side process identity: the slot it occupies, the channel endpoint
/// inherited from the supervisor and its local view of the other workers'
/// channel descriptors.
///
/// The peer view is populated exclusively by OPEN/CLOSE records and is not
/// assumed globally consistent: OPEN for an unknown slot creates the entry,
/// CLOSE for an unknown slot is a no-op, and a repeated OPEN replaces (and
/// closes) the previous descriptor.
pub struct Worker {
    slot: usize,
    worker_num: u32,
    channel: OwnedFd,
    peers: HashMap<usize, OwnedFd>,
    log: Logger,
}

impl Worker {
    /// Adopts the inherited channel descriptor, reinstalls the signal
    /// handlers lost across exec and clears the supervisor's signal mask.
    pub fn adopt(env: WorkerEnv, log: &Logger) -> Result<Worker> {
        // Validate the well-known descriptor before claiming it.
        fcntl(crate::CHANNEL_FD, FcntlArg::F_GETFD)
            .map_err(|_| Status::io_error("worker adopt", "channel descriptor missing"))?;

        let channel = unsafe { OwnedFd::from_raw_fd(crate::CHANNEL_FD) };
        fcntl(channel.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        signal::install()?;
        signal::unblock_all()?;

        let worker_log = log.new(logging::o!("slot" => env.slot));
        logging::debug!(worker_log, "worker adopted channel";
                        "context" => "adopt",
                        "worker_num" => env.worker_num);

        Ok(Worker {
            slot: env.slot,
            worker_num: env.worker_num,
            channel,
            peers: HashMap::new(),
            log: worker_log,
        })
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn worker_num(&self) -> u32 {
        self.worker_num
    }

    #[inline]
    pub fn channel_fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Records the channel descriptor for a peer slot, taking ownership of
    /// the kernel-delivered descriptor. A previous descriptor for the slot
    /// is closed.
    pub fn store_peer(&mut self, slot: usize, fd: RawFd) {
        if fd == FD_UNKNOWN || fd < 0 {
            logging::debug!(self.log, "open record without usable descriptor";
                            "context" => "store_peer",
                            "peer_slot" => slot);
            return;
        }

        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        self.peers.insert(slot, owned);

        logging::debug!(self.log, "stored peer channel";
                        "context" => "store_peer",
                        "peer_slot" => slot,
                        "fd" => fd);
    }

    /// Drops the channel descriptor for a peer slot. Unknown slots are
    /// ignored.
    pub fn close_peer(&mut self, slot: usize) {
        if self.peers.remove(&slot).is_some() {
            logging::debug!(self.log, "closed peer channel";
                            "context" => "close_peer",
                            "peer_slot" => slot);
        }
    }

    #[inline]
    pub fn peer_fd(&self, slot: usize) -> Option<RawFd> {
        self.peers.get(&slot).map(|fd| fd.as_raw_fd())
    }

    #[inline]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Sends a framed message to one peer worker, or to every known peer
    /// when `slot` is `None`. Per-peer failures during a broadcast are
    /// logged and skipped.
    pub fn sync_worker(&self, slot: Option<usize>, frame: &[u8]) -> Result<()> {
        match slot {
            Some(slot) => {
                let fd = self
                    .peer_fd(slot)
                    .ok_or_else(|| Status::corruption("sync worker", "no channel for slot"))?;
                channel::send_bytes(fd, frame, &self.log)?;
                Ok(())
            }
            None => {
                for (&slot, fd) in self.peers.iter() {
                    if let Err(status) = channel::send_bytes(fd.as_raw_fd(), frame, &self.log) {
                        logging::debug!(self.log, "peer broadcast failed";
                                        "context" => "sync_worker",
                                        "peer_slot" => slot,
                                        "status" => status.to_string());
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPair;
    use crate::message::{self, Record};
    use nix::unistd::dup;

    fn dummy_worker() -> Worker {
        // Stand-in channel endpoint owned by the test.
        let pair = ChannelPair::open().unwrap();
        let fd = dup(pair.local_fd()).unwrap();

        Worker {
            slot: 0,
            worker_num: 2,
            channel: unsafe { OwnedFd::from_raw_fd(fd) },
            peers: HashMap::new(),
            log: logging::discard(),
        }
    }

    #[test]
    fn test_env_roundtrip() {
        let export = WorkerEnv::export(5, 8, 2);
        for (key, value) in &export {
            std::env::set_var(key, value);
        }

        let env = WorkerEnv::capture().unwrap();
        assert_eq!(env, WorkerEnv { slot: 5, worker_num: 8, listeners: 2 });
        assert_eq!(
            env.listener_fds().collect::<Vec<_>>(),
            vec![crate::CHANNEL_FD + 1, crate::CHANNEL_FD + 2]
        );

        for (key, _) in &export {
            std::env::remove_var(key);
        }
        assert!(WorkerEnv::capture().is_none());
    }

    #[test]
    fn test_peer_view_is_idempotent() {
        let mut worker = dummy_worker();

        // OPEN for an unknown slot creates the entry.
        let first = dup(worker.channel_fd()).unwrap();
        worker.store_peer(4, first);
        assert_eq!(worker.peer_fd(4), Some(first));
        assert_eq!(worker.peer_count(), 1);

        // A second OPEN replaces (and closes) the old descriptor.
        let second = dup(worker.channel_fd()).unwrap();
        worker.store_peer(4, second);
        assert_eq!(worker.peer_fd(4), Some(second));
        assert_eq!(worker.peer_count(), 1);

        // CLOSE is idempotent and tolerates unknown slots.
        worker.close_peer(4);
        assert_eq!(worker.peer_fd(4), None);
        worker.close_peer(4);
        worker.close_peer(99);
        assert_eq!(worker.peer_count(), 0);
    }

    #[test]
    fn test_store_peer_rejects_placeholder() {
        let mut worker = dummy_worker();
        worker.store_peer(1, FD_UNKNOWN);
        assert_eq!(worker.peer_count(), 0);
    }

    #[test]
    fn test_sync_worker_targets_peer() {
        let mut worker = dummy_worker();

        // The "peer" is really a local socketpair so the send is observable.
        let peer_channel = ChannelPair::open().unwrap();
        let send_end = dup(peer_channel.local_fd()).unwrap();
        worker.store_peer(1, send_end);

        let frame = Record::Terminate.encode();
        worker.sync_worker(Some(1), &frame).unwrap();

        let mut buf = [0u8; 64];
        let received =
            channel::recv_bytes(peer_channel.peer_fd(), &mut buf, &logging::discard()).unwrap();
        let (_, envelope) = message::peek(&buf[..received]).unwrap().unwrap();
        assert_eq!(Record::decode(envelope.payload).unwrap(), Record::Terminate);

        // No channel for the slot surfaces as corruption.
        assert!(worker.sync_worker(Some(9), &frame).is_err());
    }
}

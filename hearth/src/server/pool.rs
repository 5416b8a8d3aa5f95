use crate::task::Task;
use crate::NUM_SHARDS;
use indexmap::IndexMap;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard};

pub type Shard = IndexMap<RawFd, Task>;

/// Shard id for a descriptor. Low bits keep a task on the same shard for
/// its whole lifetime.
#[inline]
pub fn shard_of(fd: RawFd) -> usize {
    (fd as usize) % NUM_SHARDS
}

/// The worker's active tasks, split into independently locked shards keyed
/// by raw descriptor. The readiness loop locks only the shard of the task
/// whose event fired; the heartbeat sweep walks shards one at a time.
pub struct TaskPool {
    shards: Vec<Mutex<Shard>>,
}

impl TaskPool {
    pub fn new() -> TaskPool {
        let shards = (0..NUM_SHARDS).map(|_| Mutex::new(IndexMap::new())).collect();
        TaskPool { shards }
    }

    #[inline]
    pub fn lock(&self, shard: usize) -> MutexGuard<Shard> {
        self.shards[shard].lock().expect("poisoned task pool shard")
    }

    /// Files a task under the shard derived from its descriptor and returns
    /// the descriptor key.
    pub fn insert(&self, task: Task) -> RawFd {
        let fd = task.socket().raw_fd();
        self.lock(shard_of(fd)).insert(fd, task);
        fd
    }

    /// Removes and returns a task, if present.
    pub fn remove(&self, fd: RawFd) -> Option<Task> {
        self.lock(shard_of(fd)).swap_remove(&fd)
    }

    /// Total number of tasks across all shards.
    pub fn len(&self) -> usize {
        (0..NUM_SHARDS).map(|shard| self.lock(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every task. Used on the worker exit path.
    pub fn clear(&self) {
        for shard in 0..NUM_SHARDS {
            self.lock(shard).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::{Protocol, Socket};
    use mio::net::UnixStream;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn make_task() -> (Task, StdUnixStream) {
        let (local, remote) = StdUnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        let socket =
            Socket::from_unix_stream(UnixStream::from_std(local), Protocol::Unix, "pool".to_owned());
        let fd = socket.raw_fd();
        (Task::new(socket, shard_of(fd), None), remote)
    }

    #[test]
    fn test_shard_is_stable_and_bounded() {
        for fd in 0..1000 {
            let shard = shard_of(fd);
            assert!(shard < NUM_SHARDS);
            assert_eq!(shard, shard_of(fd));
        }
    }

    #[test]
    fn test_insert_remove_roundtrip() {
        let pool = TaskPool::new();
        let (task, _remote) = make_task();
        let shard = task.shard();

        let fd = pool.insert(task);
        assert_eq!(pool.len(), 1);
        assert_eq!(shard_of(fd), shard);
        assert!(pool.lock(shard).contains_key(&fd));

        let task = pool.remove(fd).unwrap();
        assert_eq!(task.socket().raw_fd(), fd);
        assert!(pool.is_empty());

        // Removing twice is a no-op.
        assert!(pool.remove(fd).is_none());
    }

    #[test]
    fn test_clear() {
        let pool = TaskPool::new();
        let mut keep = Vec::new();
        for _ in 0..8 {
            let (task, remote) = make_task();
            pool.insert(task);
            keep.push(remote);
        }

        assert_eq!(pool.len(), 8);
        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_distribution_uses_multiple_shards() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(shard_of(rng.gen_range(0..4096)));
        }
        assert!(seen.len() > 1);
    }
}

use crate::status::{Result, Status};
use nix::fcntl::{Flock, FlockArg};
use nix::libc;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};

/// Build-time choice of the accept-token primitive: advisory file lock by
/// default, POSIX named semaphore when flipped.
pub const USE_SEMAPHORE: bool = false;

enum LockState {
    Free(File),
    Held(Flock<File>),
    Closed,
}

enum Inner {
    Lock { state: LockState, path: PathBuf },
    Sem { sem: *mut libc::sem_t, name: CString },
}

/// Named OS primitive serializing which worker registers its listening
/// sockets in a given loop iteration. At most one worker holds the token;
/// a worker that dies holding it is recovered by OS ownership rules (the
/// advisory lock drops with the descriptor, the semaphore with `sem_close`).
pub struct AcceptToken {
    inner: Inner,
}

impl AcceptToken {
    /// Opens (creating if needed) the token backing at `path`. For the
    /// semaphore flavor the name is derived from the path's file stem.
    pub fn new(path: &Path) -> Result<AcceptToken> {
        if USE_SEMAPHORE {
            Self::new_semaphore(path)
        } else {
            Self::new_lock(path)
        }
    }

    fn new_lock(path: &Path) -> Result<AcceptToken> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| Status::io_error("accept token open", err.to_string()))?;

        Ok(AcceptToken {
            inner: Inner::Lock { state: LockState::Free(file), path: path.to_path_buf() },
        })
    }

    fn new_semaphore(path: &Path) -> Result<AcceptToken> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(crate::SOFTWARE_NAME);
        let name = CString::new(format!("/{}.accept", stem))
            .map_err(|err| Status::invalid_argument("accept token name", err.to_string()))?;

        let sem = unsafe {
            libc::sem_open(name.as_ptr(), libc::O_CREAT, 0o644 as libc::mode_t, 1 as libc::c_uint)
        };
        if sem == libc::SEM_FAILED {
            return Err(Status::io_error("accept token sem_open", nix::errno::Errno::last().desc()));
        }

        Ok(AcceptToken { inner: Inner::Sem { sem, name } })
    }

    fn reopen(path: &Path) -> Option<File> {
        OpenOptions::new().read(true).write(true).create(true).open(path).ok()
    }

    /// Non-blocking acquire. Returns true when this worker now holds the
    /// token.
    pub fn try_acquire(&mut self) -> bool {
        match &mut self.inner {
            Inner::Lock { state, path } => {
                match mem::replace(state, LockState::Closed) {
                    LockState::Free(file) => {
                        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                            Ok(guard) => {
                                *state = LockState::Held(guard);
                                true
                            }
                            Err((file, _)) => {
                                *state = LockState::Free(file);
                                false
                            }
                        }
                    }
                    LockState::Held(guard) => {
                        *state = LockState::Held(guard);
                        true
                    }
                    LockState::Closed => {
                        // Handle was destroyed; reopen lazily so a respawned
                        // loop can still take turns.
                        match Self::reopen(path) {
                            Some(file) => {
                                match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                                    Ok(guard) => {
                                        *state = LockState::Held(guard);
                                        true
                                    }
                                    Err((file, _)) => {
                                        *state = LockState::Free(file);
                                        false
                                    }
                                }
                            }
                            None => false,
                        }
                    }
                }
            }
            Inner::Sem { sem, .. } => unsafe { libc::sem_trywait(*sem) == 0 },
        }
    }

    /// Releases the token if held. Safe to call when not holding it.
    pub fn release(&mut self) {
        match &mut self.inner {
            Inner::Lock { state, path } => {
                match mem::replace(state, LockState::Closed) {
                    LockState::Held(guard) => match guard.unlock() {
                        Ok(file) => *state = LockState::Free(file),
                        Err(_) => {
                            // Dropping the handle released the lock with it;
                            // reopen for the next turn.
                            if let Some(file) = Self::reopen(path) {
                                *state = LockState::Free(file);
                            }
                        }
                    },
                    other => *state = other,
                }
            }
            Inner::Sem { sem, .. } => unsafe {
                libc::sem_post(*sem);
            },
        }
    }

    #[inline]
    pub fn held(&self) -> bool {
        match &self.inner {
            Inner::Lock { state: LockState::Held(_), .. } => true,
            _ => false,
        }
    }

    /// Drops the handle on the worker exit path. The semaphore name is
    /// unlinked as well.
    pub fn destroy(&mut self) {
        match &mut self.inner {
            Inner::Lock { state, .. } => {
                *state = LockState::Closed;
            }
            Inner::Sem { sem, name } => unsafe {
                libc::sem_close(*sem);
                libc::sem_unlink(name.as_ptr());
                *sem = libc::SEM_FAILED;
            },
        }
    }
}

impl Drop for AcceptToken {
    fn drop(&mut self) {
        if let Inner::Sem { sem, .. } = &self.inner {
            if *sem != libc::SEM_FAILED {
                unsafe { libc::sem_close(*sem) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutual_exclusion_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.lock");

        let mut first = AcceptToken::new(&path).unwrap();
        let mut second = AcceptToken::new(&path).unwrap();

        assert!(first.try_acquire());
        assert!(first.held());
        assert!(!second.try_acquire());

        first.release();
        assert!(!first.held());

        assert!(second.try_acquire());
        assert!(!first.try_acquire());
        second.release();
    }

    #[test]
    fn test_release_without_hold_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.lock");

        let mut token = AcceptToken::new(&path).unwrap();
        token.release();
        assert!(token.try_acquire());
    }

    #[test]
    fn test_reacquire_after_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.lock");

        let mut token = AcceptToken::new(&path).unwrap();
        assert!(token.try_acquire());
        token.destroy();

        // Destroying released the lock; a fresh handle can take it.
        let mut other = AcceptToken::new(&path).unwrap();
        assert!(other.try_acquire());
        other.release();

        // The destroyed handle reopens lazily.
        assert!(token.try_acquire());
    }

    #[test]
    fn test_dropping_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.lock");

        let mut first = AcceptToken::new(&path).unwrap();
        assert!(first.try_acquire());
        drop(first);

        let mut second = AcceptToken::new(&path).unwrap();
        assert!(second.try_acquire());
        second.release();
    }
}

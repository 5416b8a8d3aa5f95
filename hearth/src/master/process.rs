use crate::channel::ChannelPair;
use crate::status::{Result, Status};
use crate::MAX_PROCESS;

/// Respawn policy attached to a worker slot at spawn time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RespawnPolicy {
    /// Never restarted.
    NoRespawn,
    /// Restarted on any exit except deliberate shutdown.
    Respawn,
    /// Transient one-shot worker; skipped by the next signal cycle.
    JustSpawn,
    /// Replacement-cohort worker; respawnable, skipped by the next signal
    /// cycle so an in-flight reload does not kill it.
    JustRespawn,
    /// Standalone process; never respawned, never part of fan-out.
    Detached,
}

impl RespawnPolicy {
    /// Flag triple (respawn, just_spawn, detached). Each policy is
    /// independent; no policy implies another.
    #[inline]
    pub fn flags(self) -> (bool, bool, bool) {
        match self {
            RespawnPolicy::NoRespawn => (false, false, false),
            RespawnPolicy::Respawn => (true, false, false),
            RespawnPolicy::JustSpawn => (false, true, false),
            RespawnPolicy::JustRespawn => (true, true, false),
            RespawnPolicy::Detached => (false, false, true),
        }
    }
}

/// One slot of the supervisor's process table.
pub struct WorkerEntry {
    pub slot: usize,
    /// -1 while the slot is free or the child has been reaped.
    pub pid: i32,
    /// Raw wait status of the last exit.
    pub stat: i32,
    pub exited: bool,
    pub exiting: bool,
    pub respawn: bool,
    pub just_spawn: bool,
    pub detached: bool,
    pub channel: ChannelPair,
}

impl WorkerEntry {
    fn new(slot: usize) -> WorkerEntry {
        WorkerEntry {
            slot,
            pid: -1,
            stat: 0,
            exited: false,
            exiting: false,
            respawn: false,
            just_spawn: false,
            detached: false,
            channel: ChannelPair::closed(),
        }
    }

    /// True while the slot holds a process that has not been reaped.
    #[inline]
    pub fn occupied(&self) -> bool {
        self.pid != -1
    }

    /// Marks the slot as running `pid` under the given policy.
    pub fn activate(&mut self, pid: i32, policy: RespawnPolicy) {
        let (respawn, just_spawn, detached) = policy.flags();
        self.pid = pid;
        self.stat = 0;
        self.exited = false;
        self.exiting = false;
        self.respawn = respawn;
        self.just_spawn = just_spawn;
        self.detached = detached;
    }

    /// Rebinds the slot to a replacement pid, keeping the policy flags the
    /// slot already carries. Used when respawning into an explicit slot.
    pub fn reactivate(&mut self, pid: i32) {
        self.pid = pid;
        self.stat = 0;
        self.exited = false;
        self.exiting = false;
    }

    /// Clears the slot after the child has been reaped and reconciled.
    pub fn release(&mut self) {
        self.pid = -1;
        self.exited = false;
        self.exiting = false;
        self.channel.close();
    }
}

/// Fixed-capacity arena of worker slots. Slot numbers are carried in the
/// control-channel wire format, so indices stay dense and stable across
/// respawns.
pub struct ProcessTable {
    entries: Vec<WorkerEntry>,
    last_slot: usize,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        let entries = (0..MAX_PROCESS).map(WorkerEntry::new).collect();
        ProcessTable { entries, last_slot: 0 }
    }

    /// Picks a slot: an explicit slot is reused as-is, otherwise the lowest
    /// free slot wins. The chosen index is remembered so fan-out can
    /// identify the sender.
    pub fn allocate(&mut self, explicit: Option<usize>) -> Result<usize> {
        let slot = match explicit {
            Some(slot) => slot,
            None => self
                .entries
                .iter()
                .position(|entry| !entry.occupied())
                .unwrap_or(MAX_PROCESS),
        };

        if slot >= MAX_PROCESS {
            return Err(Status::io_error("spawn worker", "process table overflow"));
        }

        self.last_slot = slot;
        Ok(slot)
    }

    /// Most recently allocated slot.
    #[inline]
    pub fn last_slot(&self) -> usize {
        self.last_slot
    }

    #[inline]
    pub fn entry(&self, slot: usize) -> &WorkerEntry {
        &self.entries[slot]
    }

    #[inline]
    pub fn entry_mut(&mut self, slot: usize) -> &mut WorkerEntry {
        &mut self.entries[slot]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.entries.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerEntry> {
        self.entries.iter_mut()
    }

    /// Looks up the slot owning a reaped pid.
    pub fn find_pid(&mut self, pid: i32) -> Option<&mut WorkerEntry> {
        if pid == -1 {
            return None;
        }
        self.entries.iter_mut().find(|entry| entry.pid == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_free() {
        let mut table = ProcessTable::new();

        let first = table.allocate(None).unwrap();
        assert_eq!(first, 0);
        table.entry_mut(first).activate(100, RespawnPolicy::Respawn);

        let second = table.allocate(None).unwrap();
        assert_eq!(second, 1);
        table.entry_mut(second).activate(101, RespawnPolicy::Respawn);

        assert_eq!(table.last_slot(), 1);

        // Releasing slot 0 makes it the lowest free slot again.
        table.entry_mut(0).release();
        assert_eq!(table.allocate(None).unwrap(), 0);
    }

    #[test]
    fn test_allocate_explicit_reuses_slot() {
        let mut table = ProcessTable::new();
        table.entry_mut(7).activate(100, RespawnPolicy::Respawn);

        let slot = table.allocate(Some(7)).unwrap();
        assert_eq!(slot, 7);
        assert_eq!(table.last_slot(), 7);
    }

    #[test]
    fn test_allocate_overflow() {
        let mut table = ProcessTable::new();
        assert!(table.allocate(Some(MAX_PROCESS)).is_err());
    }

    #[test]
    fn test_activate_sets_policy_flags() {
        let mut table = ProcessTable::new();

        let entry = table.entry_mut(0);
        entry.activate(55, RespawnPolicy::JustRespawn);
        assert!(entry.respawn && entry.just_spawn && !entry.detached);
        assert!(entry.occupied());

        entry.activate(56, RespawnPolicy::Detached);
        assert!(!entry.respawn && !entry.just_spawn && entry.detached);

        entry.activate(57, RespawnPolicy::JustSpawn);
        assert!(!entry.respawn && entry.just_spawn && !entry.detached);

        entry.activate(58, RespawnPolicy::NoRespawn);
        assert!(!entry.respawn && !entry.just_spawn && !entry.detached);
    }

    #[test]
    fn test_release_frees_pid_and_channel() {
        let mut table = ProcessTable::new();
        let entry = table.entry_mut(3);

        entry.activate(42, RespawnPolicy::Respawn);
        entry.exited = true;
        entry.release();

        assert!(!entry.occupied());
        assert!(!entry.exited);
        assert!(!entry.channel.is_open());
    }

    #[test]
    fn test_find_pid() {
        let mut table = ProcessTable::new();
        table.entry_mut(4).activate(4004, RespawnPolicy::Respawn);

        assert_eq!(table.find_pid(4004).unwrap().slot, 4);
        assert!(table.find_pid(4005).is_none());
        assert!(table.find_pid(-1).is_none());
    }
}

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::PlaceOwned;
use crate::debugger::error::Error;
use crate::debugger::task::TaskId;
use crate::debugger::TargetMemory;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

/// int3, the software breakpoint trap instruction on x86-64.
pub const TRAP_BYTE: u8 = 0xCC;

/// A single entry of the breakpoint owner set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BreakpointOwner {
    /// Breakpoint is user visible and stops every logical task.
    AllTasks,
    /// Breakpoint stops a single logical task. Entries with only this kind of
    /// owner are temporary, planted by the stepping algorithms.
    Task(TaskId),
}

/// Software breakpoint. Keeps the byte that lived at the address before the
/// trap byte was written over it.
pub struct Breakpoint {
    pub id: u32,
    pub addr: RelocatedAddress,
    pub place: Option<PlaceOwned>,
    pub function: Option<String>,
    saved_byte: Cell<u8>,
    enabled: Cell<bool>,
    owners: RefCell<HashSet<BreakpointOwner>>,
}

impl Breakpoint {
    fn new(
        id: u32,
        addr: RelocatedAddress,
        place: Option<PlaceOwned>,
        function: Option<String>,
        owner: BreakpointOwner,
    ) -> Self {
        Self {
            id,
            addr,
            place,
            function,
            saved_byte: Cell::new(0),
            enabled: Cell::new(false),
            owners: RefCell::new(HashSet::from([owner])),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// True if the breakpoint stops every task.
    pub fn is_visible(&self) -> bool {
        self.owners.borrow().contains(&BreakpointOwner::AllTasks)
    }

    /// True if the breakpoint must stop the given task.
    pub fn applies_to(&self, task: TaskId) -> bool {
        let owners = self.owners.borrow();
        owners.contains(&BreakpointOwner::AllTasks) || owners.contains(&BreakpointOwner::Task(task))
    }

    /// The original first byte of the instruction behind the breakpoint.
    pub fn saved_byte(&self) -> u8 {
        self.saved_byte.get()
    }

    /// Write the trap byte at the breakpoint address, remember the original.
    pub fn enable(&self, mem: &dyn TargetMemory) -> Result<(), Error> {
        if self.enabled.get() {
            return Ok(());
        }
        let data = mem.read_memory(self.addr, 1)?;
        self.saved_byte.set(data[0]);
        mem.write_memory(self.addr, &[TRAP_BYTE])?;
        self.enabled.set(true);
        Ok(())
    }

    /// Restore the original byte at the breakpoint address.
    pub fn disable(&self, mem: &dyn TargetMemory) -> Result<(), Error> {
        if !self.enabled.get() {
            return Ok(());
        }
        mem.write_memory(self.addr, &[self.saved_byte.get()])?;
        self.enabled.set(false);
        Ok(())
    }
}

/// Passive view of a breakpoint for UI listing.
#[derive(Debug)]
pub struct BreakpointView {
    pub id: u32,
    pub addr: RelocatedAddress,
    pub place: Option<PlaceOwned>,
    pub function: Option<String>,
    pub visible: bool,
}

impl From<&Breakpoint> for BreakpointView {
    fn from(bp: &Breakpoint) -> Self {
        Self {
            id: bp.id,
            addr: bp.addr,
            place: bp.place.clone(),
            function: bp.function.clone(),
            visible: bp.is_visible(),
        }
    }
}

/// Breakpoint table keyed by address.
///
/// While the debugee is running the set of addresses whose first byte is the
/// trap byte equals the set of enabled entries here, except the transient
/// window when a thread single-steps over a displaced breakpoint.
#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: HashMap<RelocatedAddress, Breakpoint>,
    next_id: u32,
}

impl BreakpointRegistry {
    /// Add `owner` to a breakpoint at `addr`, creating and arming the
    /// breakpoint if it does not exist yet.
    ///
    /// # Arguments
    ///
    /// * `addr`: breakpoint address.
    /// * `owner`: owner to add into the owner set.
    /// * `place`: resolved source position, if any.
    /// * `function`: resolved function name, if any.
    /// * `mem`: debugee memory; `None` when the debugee is not yet started,
    ///   the trap byte then is written by [`BreakpointRegistry::enable_all`].
    pub fn set(
        &mut self,
        addr: RelocatedAddress,
        owner: BreakpointOwner,
        place: Option<PlaceOwned>,
        function: Option<String>,
        mem: Option<&dyn TargetMemory>,
    ) -> Result<&Breakpoint, Error> {
        if let Some(bp) = self.breakpoints.get(&addr) {
            bp.owners.borrow_mut().insert(owner);
            return Ok(&self.breakpoints[&addr]);
        }

        self.next_id += 1;
        let bp = Breakpoint::new(self.next_id, addr, place, function, owner);
        if let Some(mem) = mem {
            bp.enable(mem)?;
        }
        self.breakpoints.insert(addr, bp);
        Ok(&self.breakpoints[&addr])
    }

    /// Remove `owner` from the breakpoint at `addr`. An entry whose owner set
    /// became empty is dropped and the original byte restored.
    pub fn clear(
        &mut self,
        addr: RelocatedAddress,
        owner: BreakpointOwner,
        mem: Option<&dyn TargetMemory>,
    ) -> Result<BreakpointView, Error> {
        let bp = self
            .breakpoints
            .get(&addr)
            .ok_or_else(|| Error::NoSuchBreakpoint(addr.to_string()))?;

        bp.owners.borrow_mut().remove(&owner);
        let view = BreakpointView::from(bp);

        if bp.owners.borrow().is_empty() {
            if let Some(mem) = mem {
                bp.disable(mem)?;
            }
            self.breakpoints.remove(&addr);
        }
        Ok(view)
    }

    /// True if a breakpoint exists at `addr`. With `visible_only` an entry
    /// counts only when it stops every task.
    pub fn exists(&self, addr: RelocatedAddress, visible_only: bool) -> bool {
        match self.breakpoints.get(&addr) {
            None => false,
            Some(bp) => !visible_only || bp.is_visible(),
        }
    }

    pub fn get(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.values().find(|bp| bp.id == id)
    }

    /// Write trap bytes for every registered breakpoint. Called once the
    /// debugee reaches its entry point.
    pub fn enable_all(&mut self, mem: &dyn TargetMemory) -> Result<(), Error> {
        for bp in self.breakpoints.values() {
            bp.enable(mem)?;
        }
        Ok(())
    }

    /// Restore original bytes of every enabled breakpoint.
    pub fn disable_all(&mut self, mem: &dyn TargetMemory) -> Result<(), Error> {
        for bp in self.breakpoints.values() {
            bp.disable(mem)?;
        }
        Ok(())
    }

    /// Drop every entry. Used on debugee exit, no memory to restore anymore.
    pub fn teardown(&mut self) {
        self.breakpoints.clear();
    }

    /// Active breakpoints ordered by id.
    pub fn snapshot(&self) -> Vec<BreakpointView> {
        let mut views: Vec<BreakpointView> =
            self.breakpoints.values().map(BreakpointView::from).collect();
        views.sort_by_key(|view| view.id);
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeMemory(RefCell<Vec<u8>>);

    impl FakeMemory {
        fn new(size: usize) -> Self {
            Self(RefCell::new((0..size).map(|b| b as u8).collect()))
        }

        fn byte(&self, addr: usize) -> u8 {
            self.0.borrow()[addr]
        }
    }

    impl TargetMemory for FakeMemory {
        fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
            let addr = addr.as_usize();
            Ok(self.0.borrow()[addr..addr + len].to_vec())
        }

        fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
            let addr = addr.as_usize();
            self.0.borrow_mut()[addr..addr + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn test_set_writes_trap_byte() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();

        let addr = RelocatedAddress::from(0x10usize);
        let original = mem.byte(0x10);
        registry
            .set(addr, BreakpointOwner::AllTasks, None, None, Some(&mem))
            .unwrap();

        assert_eq!(mem.byte(0x10), TRAP_BYTE);
        assert_eq!(registry.get(addr).unwrap().saved_byte(), original);
    }

    #[test]
    fn test_clear_restores_original_byte() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();

        let addr = RelocatedAddress::from(0x20usize);
        let original = mem.byte(0x20);

        registry
            .set(addr, BreakpointOwner::AllTasks, None, None, Some(&mem))
            .unwrap();
        registry
            .clear(addr, BreakpointOwner::AllTasks, Some(&mem))
            .unwrap();

        assert_eq!(mem.byte(0x20), original);
        assert!(!registry.exists(addr, false));

        // repeated set/clear keeps memory byte identical
        registry
            .set(addr, BreakpointOwner::AllTasks, None, None, Some(&mem))
            .unwrap();
        registry
            .clear(addr, BreakpointOwner::AllTasks, Some(&mem))
            .unwrap();
        assert_eq!(mem.byte(0x20), original);
    }

    #[test]
    fn test_clear_unknown_addr() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();

        let err = registry
            .clear(
                RelocatedAddress::from(0x30usize),
                BreakpointOwner::AllTasks,
                Some(&mem),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchBreakpoint(_)));
    }

    #[test]
    fn test_owner_union_and_partial_clear() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();
        let addr = RelocatedAddress::from(0x8usize);

        registry
            .set(addr, BreakpointOwner::AllTasks, None, None, Some(&mem))
            .unwrap();
        registry
            .set(addr, BreakpointOwner::Task(TaskId(3)), None, None, Some(&mem))
            .unwrap();

        // one owner gone, breakpoint stays armed
        registry
            .clear(addr, BreakpointOwner::Task(TaskId(3)), Some(&mem))
            .unwrap();
        assert_eq!(mem.byte(0x8), TRAP_BYTE);
        assert!(registry.exists(addr, true));

        // last owner gone, byte restored
        registry
            .clear(addr, BreakpointOwner::AllTasks, Some(&mem))
            .unwrap();
        assert_ne!(mem.byte(0x8), TRAP_BYTE);
        assert!(!registry.exists(addr, false));
    }

    #[test]
    fn test_temporary_breakpoint_invisible() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();
        let addr = RelocatedAddress::from(0x18usize);

        let bp = registry
            .set(addr, BreakpointOwner::Task(TaskId(7)), None, None, Some(&mem))
            .unwrap();
        assert!(!bp.is_visible());
        assert!(bp.applies_to(TaskId(7)));
        assert!(!bp.applies_to(TaskId(8)));

        assert!(registry.exists(addr, false));
        assert!(!registry.exists(addr, true));
    }

    #[test]
    fn test_ids_assigned_densely() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();

        for (n, addr) in [0x8usize, 0x10, 0x28].into_iter().enumerate() {
            let bp = registry
                .set(
                    RelocatedAddress::from(addr),
                    BreakpointOwner::AllTasks,
                    None,
                    None,
                    Some(&mem),
                )
                .unwrap();
            assert_eq!(bp.id, n as u32 + 1);
        }
    }

    #[test]
    fn test_deferred_arming() {
        let mem = FakeMemory::new(64);
        let mut registry = BreakpointRegistry::default();
        let addr = RelocatedAddress::from(0x38usize);
        let original = mem.byte(0x38);

        registry
            .set(addr, BreakpointOwner::AllTasks, None, None, None)
            .unwrap();
        assert_eq!(mem.byte(0x38), original);

        registry.enable_all(&mem).unwrap();
        assert_eq!(mem.byte(0x38), TRAP_BYTE);

        registry.disable_all(&mem).unwrap();
        assert_eq!(mem.byte(0x38), original);
    }
}

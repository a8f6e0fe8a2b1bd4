// Strand Heap
// Refcounted objects addressed by handles, recycled through pools

use serde::Serialize;
use smallvec::SmallVec;
use tracing::trace;

use super::closure::{Closure, FuncTarget, Upval};
use super::pool::{Pool, PoolStats};
use super::stack::ValueStack;
use super::value::{Handle, Refs, Value};

/// Refcounted list of values
#[derive(Debug, Default)]
pub struct ValList {
    pub refs: Refs,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub closures: PoolStats,
    pub lists: PoolStats,
}

/// Owner of every refcounted object of a VM.
///
/// Slots are never freed, a released object keeps its slot and its id
/// goes back to the matching pool.
#[derive(Debug, Default)]
pub struct Heap {
    closures: Vec<Closure>,
    closure_ids: Pool<u32>,
    lists: Vec<ValList>,
    list_ids: Pool<u32>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// New closure with refs 1, the returned value owns that reference
    pub fn new_closure(&mut self, target: FuncTarget) -> Value {
        let closures = &mut self.closures;
        let id = self.closure_ids.acquire_with(|| {
            closures.push(Closure::default());
            (closures.len() - 1) as u32
        });
        let closure = &mut self.closures[id as usize];
        closure.refs.revive();
        closure.target = target;
        Value::from_handle(Handle::Closure(id))
    }

    /// New list with refs 1 taking ownership of `items`
    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        let lists = &mut self.lists;
        let id = self.list_ids.acquire_with(|| {
            lists.push(ValList::default());
            (lists.len() - 1) as u32
        });
        let list = &mut self.lists[id as usize];
        list.refs.revive();
        list.items = items;
        Value::from_handle(Handle::List(id))
    }

    pub fn closure(&self, id: u32) -> &Closure {
        &self.closures[id as usize]
    }

    pub fn list(&self, id: u32) -> &ValList {
        &self.lists[id as usize]
    }

    /// Capture an already retained value into a closure
    pub fn push_upval(&mut self, id: u32, local_idx: usize, value: Value) {
        self.closures[id as usize].upvals.push(Upval { local_idx, value });
    }

    pub fn refs(&self, handle: Handle) -> i32 {
        match handle {
            Handle::Closure(id) => self.closures[id as usize].refs.count(),
            Handle::List(id) => self.lists[id as usize].refs.count(),
        }
    }

    pub fn retain(&mut self, value: &Value) {
        match value.refc {
            Some(Handle::Closure(id)) => self.closures[id as usize].refs.retain(),
            Some(Handle::List(id)) => self.lists[id as usize].refs.retain(),
            None => {}
        }
    }

    /// Drop the slot's reference and forget both its handle and payload
    pub fn release(&mut self, value: &mut Value) {
        if let Some(handle) = value.refc {
            self.release_handle(handle);
        }
        value.clear();
    }

    /// Release every live slot of `stack` and empty it
    pub fn release_stack(&mut self, stack: &mut ValueStack) {
        while let Ok(mut value) = stack.pop() {
            self.release(&mut value);
        }
    }

    fn release_handle(&mut self, handle: Handle) {
        // children are released iteratively, nesting can be deep
        let mut pending: SmallVec<[Handle; 8]> = SmallVec::new();
        pending.push(handle);

        while let Some(handle) = pending.pop() {
            match handle {
                Handle::Closure(id) => {
                    let closure = &mut self.closures[id as usize];
                    if !closure.refs.release() {
                        continue;
                    }
                    for upval in closure.upvals.drain(..) {
                        if let Some(child) = upval.value.refc {
                            pending.push(child);
                        }
                    }
                    closure.target = FuncTarget::None;
                    closure.refs.rearm();
                    self.closure_ids.release(id);
                    trace!(id, "closure released");
                }
                Handle::List(id) => {
                    let list = &mut self.lists[id as usize];
                    if !list.refs.release() {
                        continue;
                    }
                    for item in list.items.drain(..) {
                        if let Some(child) = item.refc {
                            pending.push(child);
                        }
                    }
                    list.refs.rearm();
                    self.list_ids.release(id);
                    trace!(id, "list released");
                }
            }
        }
    }

    /// Objects currently alive
    pub fn live(&self) -> usize {
        self.closure_ids.busy() + self.list_ids.busy()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            closures: self.closure_ids.stats(),
            lists: self.list_ids.stats(),
        }
    }
}

// Strand Value Stack
// One contiguous operand stack shared by every frame of an execution

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use super::value::Value;
use crate::error::{Fault, FaultResult};

/// Shared handle, frames keep one to the stack hosting their locals
pub type StackRef = Rc<RefCell<ValueStack>>;

/// Operand stack addressed by `sp`.
///
/// Slots at or above `sp` are empty unless they were staged for the locals
/// of a frame about to be entered.
#[derive(Debug, Default)]
pub struct ValueStack {
    vals: Vec<Value>,
    sp: usize,
}

impl ValueStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vals: Vec::with_capacity(capacity),
            sp: 0,
        }
    }

    pub fn new_ref(capacity: usize) -> StackRef {
        Rc::new(RefCell::new(Self::with_capacity(capacity)))
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn is_empty(&self) -> bool {
        self.sp == 0
    }

    pub fn push(&mut self, value: Value) {
        if self.sp == self.vals.len() {
            self.vals.push(value);
        } else {
            self.vals[self.sp] = value;
        }
        self.sp += 1;
    }

    pub fn pop(&mut self) -> FaultResult<Value> {
        if self.sp == 0 {
            return Err(Fault::StackUnderflow);
        }
        self.sp -= 1;
        Ok(mem::take(&mut self.vals[self.sp]))
    }

    pub fn peek(&self) -> FaultResult<&Value> {
        if self.sp == 0 {
            return Err(Fault::StackUnderflow);
        }
        Ok(&self.vals[self.sp - 1])
    }

    /// Advance `sp` by `n`, keeping any staged values
    pub fn reserve(&mut self, n: usize) {
        let end = self.sp + n;
        if self.vals.len() < end {
            self.vals.resize_with(end, Value::default);
        }
        self.sp = end;
    }

    /// Place a value `ahead` slots above `sp` without moving it
    pub fn stage(&mut self, ahead: usize, value: Value) {
        let idx = self.sp + ahead;
        if self.vals.len() <= idx {
            self.vals.resize_with(idx + 1, Value::default);
        }
        self.vals[idx] = value;
    }

    pub fn get(&self, idx: usize) -> FaultResult<&Value> {
        if idx >= self.sp {
            return Err(Fault::BadLocal(idx));
        }
        Ok(&self.vals[idx])
    }

    pub fn get_mut(&mut self, idx: usize) -> FaultResult<&mut Value> {
        if idx >= self.sp {
            return Err(Fault::BadLocal(idx));
        }
        Ok(&mut self.vals[idx])
    }

    /// Store a value and hand back the previous occupant for releasing
    pub fn replace(&mut self, idx: usize, value: Value) -> FaultResult<Value> {
        let slot = self.get_mut(idx)?;
        Ok(mem::replace(slot, value))
    }

    /// Move a value out, leaving the slot empty
    pub fn take(&mut self, idx: usize) -> FaultResult<Value> {
        Ok(mem::take(self.get_mut(idx)?))
    }

    /// Retract `sp`, clearing the slots above it without releasing them
    pub fn truncate(&mut self, new_sp: usize) {
        if new_sp >= self.sp {
            return;
        }
        for v in &mut self.vals[new_sp..self.sp] {
            v.clear();
        }
        self.sp = new_sp;
    }

    /// Move every live value out, ownership goes with them
    pub fn drain(&mut self) -> Vec<Value> {
        let values = self.vals[..self.sp].iter_mut().map(mem::take).collect();
        self.sp = 0;
        values
    }

    /// Live slots `[0, sp)`
    pub fn slots(&self) -> &[Value] {
        &self.vals[..self.sp]
    }

    /// Any slot, including the ones above `sp`
    pub fn raw(&self, idx: usize) -> Option<&Value> {
        self.vals.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut stack = ValueStack::with_capacity(4);
        stack.push(Value::num(1.0));
        stack.push(Value::num(2.0));
        assert_eq!(stack.sp(), 2);
        assert_eq!(stack.pop().unwrap().num, 2.0);
        assert!(stack.raw(1).unwrap().is_nil());
        assert_eq!(stack.pop().unwrap().num, 1.0);
        assert_eq!(stack.pop(), Err(Fault::StackUnderflow));
    }

    #[test]
    fn test_stage_survives_reserve() {
        let mut stack = ValueStack::default();
        stack.push(Value::num(1.0));
        stack.stage(1, Value::str("up"));
        stack.reserve(2);
        assert_eq!(stack.sp(), 3);
        assert!(stack.get(1).unwrap().is_nil());
        assert_eq!(stack.get(2).unwrap().as_str().unwrap(), "up");
    }

    #[test]
    fn test_truncate_clears_above() {
        let mut stack = ValueStack::default();
        for i in 0..4 {
            stack.push(Value::num(i as f64));
        }
        stack.truncate(1);
        assert_eq!(stack.sp(), 1);
        assert!(stack.raw(2).unwrap().is_nil());
        assert_eq!(stack.get(2), Err(Fault::BadLocal(2)));
    }
}

//! Roots held outside handle scopes.
//!
//! Handle scopes and the global pool are walked by the heap itself. Anything
//! else that holds values across a collection (the VM value stack, an
//! embedder's own tables) implements [`RootProvider`] and is passed to
//! [`Heap::collect_with`](crate::Heap::collect_with).

use crate::object::Value;

/// A set of value slots the collector treats as roots.
pub trait RootProvider {
    /// Call `visitor` with every root slot. The visitor may rewrite the
    /// slot when its target moves.
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// No extra roots.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

impl RootProvider for [Value] {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for slot in self {
            visitor(slot);
        }
    }
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.as_mut_slice().visit_roots(visitor);
    }
}

impl<A: RootProvider + ?Sized, B: RootProvider + ?Sized> RootProvider for (&mut A, &mut B) {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.0.visit_roots(visitor);
        self.1.visit_roots(visitor);
    }
}

// ============================================================================
// ExecutionStack - VM value stack
// ============================================================================

/// Value stack of an interpreter, split into call frames.
///
/// Every slot below the top is a root.
#[derive(Debug, Default)]
pub struct ExecutionStack {
    values: Vec<Value>,
    /// Base index of each open frame.
    frames: Vec<usize>,
}

impl ExecutionStack {
    /// Create a new empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Push a value onto the current frame.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Pop a value off the current frame.
    ///
    /// # Panics
    ///
    /// Panics when the current frame is empty.
    pub fn pop(&mut self) -> Value {
        let base = self.frames.last().copied().unwrap_or(0);
        assert!(self.values.len() > base, "pop from an empty frame");
        self.values.pop().unwrap_or_default()
    }

    /// Value `index` slots below the top.
    #[must_use]
    pub fn peek(&self, index: usize) -> Option<Value> {
        self.values.iter().rev().nth(index).copied()
    }

    /// Slot `index` of the current frame.
    #[must_use]
    pub fn local(&self, index: usize) -> Option<Value> {
        let base = self.frames.last().copied().unwrap_or(0);
        self.values.get(base + index).copied()
    }

    /// Overwrite slot `index` of the current frame.
    ///
    /// # Panics
    ///
    /// Panics when the slot is past the top.
    pub fn set_local(&mut self, index: usize, value: Value) {
        let base = self.frames.last().copied().unwrap_or(0);
        self.values[base + index] = value;
    }

    /// Open a frame whose first slot is the current top.
    pub fn enter_frame(&mut self) {
        self.frames.push(self.values.len());
    }

    /// Drop the current frame and every value in it.
    pub fn leave_frame(&mut self) {
        if let Some(base) = self.frames.pop() {
            self.values.truncate(base);
        }
    }

    /// Number of open frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of values on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when no values are on the stack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl RootProvider for ExecutionStack {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.values.visit_roots(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames() {
        let mut stack = ExecutionStack::new();
        stack.push(Value::from_int(1));
        stack.enter_frame();
        stack.push(Value::from_int(2));
        stack.push(Value::from_int(3));
        assert_eq!(stack.local(0), Some(Value::from_int(2)));
        assert_eq!(stack.peek(0), Some(Value::from_int(3)));
        stack.set_local(1, Value::NIL);
        assert_eq!(stack.peek(0), Some(Value::NIL));
        stack.leave_frame();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_visit_rewrites_slots() {
        let mut stack = ExecutionStack::new();
        stack.push(Value::from_int(1));
        stack.push(Value::from_int(2));
        stack.visit_roots(&mut |v| {
            if let Some(n) = v.as_int() {
                *v = Value::from_int(n * 10);
            }
        });
        assert_eq!(stack.pop(), Value::from_int(20));
        assert_eq!(stack.pop(), Value::from_int(10));
    }

    #[test]
    #[should_panic(expected = "empty frame")]
    fn test_pop_below_frame_panics() {
        let mut stack = ExecutionStack::new();
        stack.push(Value::from_int(1));
        stack.enter_frame();
        let _ = stack.pop();
    }

    #[test]
    fn test_pair_provider() {
        let mut a = vec![Value::from_int(1)];
        let mut b = ExecutionStack::new();
        b.push(Value::from_int(2));
        let mut count = 0;
        (&mut a, &mut b).visit_roots(&mut |_| count += 1);
        assert_eq!(count, 2);
    }
}

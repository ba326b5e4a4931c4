use object::Value;

use crate::RuntimeError;

/// The operand stack. Also holds every call frame.
///
/// Positions are absolute indices from the bottom; `top` is one past the
/// last pushed value.
#[derive(Debug)]
pub struct Stack {
    values: Vec<Value>,
    capacity: usize,
}

impl Stack {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.values.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline(always)]
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.values.len() == self.capacity {
            return Err(RuntimeError::StackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.values.pop().ok_or(RuntimeError::StackUnderflow)
    }

    #[inline(always)]
    pub fn peek(&self) -> Result<Value, RuntimeError> {
        self.values.last().copied().ok_or(RuntimeError::StackUnderflow)
    }

    /// Push `n` uninitialized values.
    pub fn pushn(&mut self, n: usize) -> Result<(), RuntimeError> {
        if n > self.capacity - self.values.len() {
            return Err(RuntimeError::StackOverflow);
        }
        self.values
            .resize(self.values.len() + n, Value::UNINITIALIZED);
        Ok(())
    }

    pub fn popn(&mut self, n: usize) -> Result<(), RuntimeError> {
        let Some(top) = self.values.len().checked_sub(n) else {
            return Err(RuntimeError::StackUnderflow);
        };
        self.values.truncate(top);
        Ok(())
    }

    /// Move the cursor back to a previously observed position.
    pub fn restore(&mut self, position: usize) {
        debug_assert!(position <= self.top(), "restore moves forward");
        self.values.truncate(position);
    }

    pub fn get(&self, position: usize) -> Option<Value> {
        self.values.get(position).copied()
    }

    pub fn set(&mut self, position: usize, value: Value) -> Result<(), RuntimeError> {
        let slot = self
            .values
            .get_mut(position)
            .ok_or(RuntimeError::StackUnderflow)?;
        *slot = value;
        Ok(())
    }

    /// Live values, bottom first.
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

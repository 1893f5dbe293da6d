//! Command stack for undo and redo.
//!
//! Commands are plain values; whoever pops one performs it and registers the
//! inverse. While an undo is running, registrations land on the redo stack;
//! while a redo is running they land on the undo stack without clearing redo.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Undoing,
    Redoing,
}

#[derive(Debug, Clone)]
pub struct UndoStack<C> {
    undo: Vec<C>,
    redo: Vec<C>,
    phase: Phase,
    limit: usize,
}

impl<C> Default for UndoStack<C> {
    fn default() -> Self {
        Self::with_limit(0)
    }
}

impl<C> UndoStack<C> {
    /// `limit == 0` means unbounded.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            phase: Phase::Idle,
            limit,
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    pub fn register(&mut self, command: C) {
        match self.phase {
            Phase::Undoing => self.redo.push(command),
            Phase::Redoing => {
                self.undo.push(command);
                self.trim();
            }
            Phase::Idle => {
                self.undo.push(command);
                self.redo.clear();
                self.trim();
            }
        }
    }

    /// Pops the next undo command and enters the undoing phase. Call
    /// [`UndoStack::finish`] once it has been performed.
    pub fn take_undo(&mut self) -> Option<C> {
        let c = self.undo.pop()?;
        self.phase = Phase::Undoing;
        Some(c)
    }

    pub fn take_redo(&mut self) -> Option<C> {
        let c = self.redo.pop()?;
        self.phase = Phase::Redoing;
        Some(c)
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Puts a command that failed to perform back where it was taken from
    /// and leaves the running phase.
    pub fn restore(&mut self, command: C) {
        match self.phase {
            Phase::Redoing => self.redo.push(command),
            Phase::Undoing | Phase::Idle => self.undo.push(command),
        }
        self.phase = Phase::Idle;
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn peek_undo(&self) -> Option<&C> {
        self.undo.last()
    }

    pub fn peek_redo(&self) -> Option<&C> {
        self.redo.last()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.phase = Phase::Idle;
    }

    fn trim(&mut self) {
        if self.limit > 0 && self.undo.len() > self.limit {
            let excess = self.undo.len() - self.limit;
            self.undo.drain(..excess);
        }
    }
}

//! Run-time state of nested `\if` blocks for one client.

/// State of one `\if` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfState {
    /// Not inside any block
    None,
    /// The current branch is being executed
    True,
    /// No branch has been taken yet; the current one is skipped
    False,
    /// The whole block is skipped, because a branch was already taken or an outer block is
    /// inactive
    Ignored,
    /// In the `\else` branch, which is executed
    ElseTrue,
    /// In the `\else` branch, which is skipped
    ElseFalse,
}

impl IfState {
    pub fn is_active(self) -> bool {
        matches!(self, IfState::None | IfState::True | IfState::ElseTrue)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalStack {
    stack: Vec<IfState>,
}

impl ConditionalStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// State of the innermost block, [`IfState::None`] when outside any block.
    pub fn peek(&self) -> IfState {
        self.stack.last().copied().unwrap_or(IfState::None)
    }

    pub fn push(&mut self, state: IfState) {
        self.stack.push(state);
    }

    /// Replaces the state of the innermost block. Returns false when outside any block.
    pub fn poke(&mut self, state: IfState) -> bool {
        match self.stack.last_mut() {
            Some(top) => {
                *top = state;
                true
            }
            None => false,
        }
    }

    pub fn pop(&mut self) -> Option<IfState> {
        self.stack.pop()
    }

    /// Whether commands at the current position should be executed.
    pub fn active(&self) -> bool {
        self.peek().is_active()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    /// `\if`: enter a block. `condition` is only consulted if the enclosing code is executing.
    pub fn enter_if<E>(
        &mut self,
        condition: impl FnOnce() -> Result<bool, E>,
    ) -> Result<(), E> {
        let state = if !self.active() {
            IfState::Ignored
        } else if condition()? {
            IfState::True
        } else {
            IfState::False
        };
        self.push(state);
        Ok(())
    }

    /// `\elif`: `condition` is only consulted if no earlier branch was taken.
    pub fn enter_elif<E>(
        &mut self,
        condition: impl FnOnce() -> Result<bool, E>,
    ) -> Result<(), E> {
        let next = match self.peek() {
            IfState::False => {
                if condition()? {
                    IfState::True
                } else {
                    IfState::False
                }
            }
            IfState::True => IfState::Ignored,
            other => other,
        };
        self.poke(next);
        Ok(())
    }

    /// `\else`
    pub fn enter_else(&mut self) {
        let next = match self.peek() {
            IfState::True => IfState::ElseFalse,
            IfState::False => IfState::ElseTrue,
            other => other,
        };
        self.poke(next);
    }

    /// `\endif`
    pub fn exit(&mut self) {
        self.pop();
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    fn yes() -> Result<bool, Infallible> {
        Ok(true)
    }

    fn no() -> Result<bool, Infallible> {
        Ok(false)
    }

    fn never() -> Result<bool, Infallible> {
        panic!("condition must not be evaluated")
    }

    #[test]
    fn if_else_endif() {
        let mut stack = ConditionalStack::new();
        assert!(stack.active());

        stack.enter_if(no).unwrap();
        assert!(!stack.active());
        stack.enter_else();
        assert_eq!(stack.peek(), IfState::ElseTrue);
        assert!(stack.active());
        stack.exit();
        assert!(stack.is_empty());
    }

    #[test]
    fn elif_chain_takes_first_true_branch_only() {
        let mut stack = ConditionalStack::new();
        stack.enter_if(no).unwrap();
        stack.enter_elif(yes).unwrap();
        assert!(stack.active());
        stack.enter_elif(never).unwrap();
        assert_eq!(stack.peek(), IfState::Ignored);
        stack.enter_else();
        assert_eq!(stack.peek(), IfState::Ignored);
        assert!(!stack.active());
    }

    #[test]
    fn nested_blocks_inside_inactive_branch_are_ignored() {
        let mut stack = ConditionalStack::new();
        stack.enter_if(no).unwrap();
        stack.enter_if(never).unwrap();
        assert_eq!(stack.peek(), IfState::Ignored);
        stack.enter_else();
        assert!(!stack.active());
        stack.exit();
        stack.enter_else();
        assert!(stack.active());
        stack.exit();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn failed_condition_leaves_stack_untouched() {
        let mut stack = ConditionalStack::new();
        assert_eq!(stack.enter_if(|| Err("boom")), Err("boom"));
        assert!(stack.is_empty());
    }
}

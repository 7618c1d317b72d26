//! LIFO stack of pending teardown actions.
//!
//! Every phase that acquires a host resource which must outlive the
//! acquiring function (a mapped disk, a mounted filesystem) pushes the
//! matching release here. The stack is drained when the build finishes and,
//! unconditionally, when a dispatched hook fails.
//!
//! Actions receive the build context mutably instead of capturing it, so a
//! teardown can update the layout (for example clear mapper device paths)
//! without shared ownership.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};

type Action<C> = Box<dyn FnOnce(&mut C) -> Result<()>>;

/// Identifies a pushed action so it can be cancelled later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupHandle(u64);

/// An action popped off the stack, ready to run.
pub struct PendingCleanup<C> {
    pub handle: CleanupHandle,
    pub label: String,
    action: Action<C>,
}

impl<C> PendingCleanup<C> {
    pub fn run(self, ctx: &mut C) -> Result<()> {
        (self.action)(ctx)
    }
}

pub struct CleanupStack<C> {
    actions: VecDeque<(CleanupHandle, String, Action<C>)>,
    next_id: u64,
}

impl<C> Default for CleanupStack<C> {
    fn default() -> Self {
        Self {
            actions: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<C> CleanupStack<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` to run before everything already on the stack.
    pub fn push<F>(&mut self, label: impl Into<String>, action: F) -> CleanupHandle
    where
        F: FnOnce(&mut C) -> Result<()> + 'static,
    {
        let handle = CleanupHandle(self.next_id);
        self.next_id += 1;
        let label = label.into();
        debug!("registered cleanup: {}", label);
        self.actions.push_front((handle, label, Box::new(action)));
        handle
    }

    /// Drop a pending action, e.g. because it was already performed by hand.
    ///
    /// Returns whether the action was still pending. Cancelling an unknown
    /// or already-run handle is not an error.
    pub fn cancel(&mut self, handle: CleanupHandle) -> bool {
        match self.actions.iter().position(|(h, _, _)| *h == handle) {
            Some(pos) => {
                if let Some((_, label, _)) = self.actions.remove(pos) {
                    debug!("cancelled cleanup: {}", label);
                }
                true
            }
            None => false,
        }
    }

    /// Take the most recently pushed action.
    pub fn pop(&mut self) -> Option<PendingCleanup<C>> {
        self.actions
            .pop_front()
            .map(|(handle, label, action)| PendingCleanup {
                handle,
                label,
                action,
            })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|(_, label, _)| label.as_str())
    }

    /// Run every action, newest first, against a context that does not own
    /// this stack. See [`unwind`] for stacks stored inside the context.
    pub fn run_all(&mut self, ctx: &mut C) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(pending) = self.pop() {
            run_pending(pending, ctx, &mut failures);
        }
        into_result(failures)
    }
}

/// Drain a stack that lives inside `ctx` itself.
///
/// Actions may push further actions while running; those run too. Every
/// action is attempted even when earlier ones fail; the failures are
/// reported together at the end.
pub fn unwind<C, F>(ctx: &mut C, stack: F) -> Result<()>
where
    F: Fn(&mut C) -> &mut CleanupStack<C>,
{
    let mut failures = Vec::new();
    while let Some(pending) = stack(ctx).pop() {
        run_pending(pending, ctx, &mut failures);
    }
    into_result(failures)
}

fn run_pending<C>(pending: PendingCleanup<C>, ctx: &mut C, failures: &mut Vec<Error>) {
    let label = pending.label.clone();
    debug!("running cleanup: {}", label);
    if let Err(e) = pending.run(ctx) {
        warn!("cleanup '{}' failed: {}", label, e);
        failures.push(e);
    }
}

fn into_result(failures: Vec<Error>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Cleanup(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_run_newest_first() {
        let mut stack: CleanupStack<Vec<&str>> = CleanupStack::new();
        stack.push("a", |log| {
            log.push("a");
            Ok(())
        });
        stack.push("b", |log| {
            log.push("b");
            Ok(())
        });

        let mut log = Vec::new();
        stack.run_all(&mut log).unwrap();
        assert_eq!(log, vec!["b", "a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_cancelled_action_never_runs() {
        let mut stack: CleanupStack<Vec<&str>> = CleanupStack::new();
        let a = stack.push("a", |log| {
            log.push("a");
            Ok(())
        });
        assert!(stack.cancel(a));

        let mut log = Vec::new();
        stack.run_all(&mut log).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn test_cancel_unknown_handle_is_noop() {
        let mut stack: CleanupStack<Vec<&str>> = CleanupStack::new();
        let a = stack.push("a", |_| Ok(()));
        stack.run_all(&mut Vec::new()).unwrap();
        assert!(!stack.cancel(a));
    }

    #[test]
    fn test_failures_do_not_stop_the_unwind() {
        let mut stack: CleanupStack<Vec<&str>> = CleanupStack::new();
        stack.push("a", |log| {
            log.push("a");
            Ok(())
        });
        stack.push("broken", |_| Err(Error::config("umount failed")));
        stack.push("c", |log| {
            log.push("c");
            Ok(())
        });

        let mut log = Vec::new();
        let err = stack.run_all(&mut log).unwrap_err();
        assert_eq!(log, vec!["c", "a"]);
        match err {
            Error::Cleanup(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    struct Ctx {
        stack: CleanupStack<Ctx>,
        log: Vec<String>,
    }

    #[test]
    fn test_unwind_stack_owned_by_context() {
        let mut ctx = Ctx {
            stack: CleanupStack::new(),
            log: Vec::new(),
        };
        ctx.stack.push("outer", |c: &mut Ctx| {
            c.log.push("outer".into());
            Ok(())
        });
        ctx.stack.push("inner", |c: &mut Ctx| {
            c.log.push("inner".into());
            c.stack.push("late", |c: &mut Ctx| {
                c.log.push("late".into());
                Ok(())
            });
            Ok(())
        });

        unwind(&mut ctx, |c| &mut c.stack).unwrap();
        assert_eq!(ctx.log, vec!["inner", "late", "outer"]);
    }
}

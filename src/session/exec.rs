//! Single-threaded cooperative task queue.
//!
//! All session objects live on one thread; asynchronous completions are
//! modeled as tasks posted to this queue and run when the owner drains it
//! between I/O events. The queue is passed to components explicitly (there
//! is no "current loop" global), which keeps the one real thread hop in
//! the crate (the pending-connection worker) easy to follow.
//!
//! The crate-wide discipline for failure paths is "always post, never call
//! back inline": a precondition error reaches the caller's callback on a
//! later drain, exactly like a real reply would, so callers never observe
//! reentrant completion.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

#[derive(Clone, Default)]
pub struct EventQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task to run on the next drain.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Run queued tasks until the queue is empty, including tasks posted
    /// by the tasks themselves. Returns the number of tasks executed.
    pub fn drain(&self) -> usize {
        let mut executed = 0;
        loop {
            // the borrow must not be held while the task runs, tasks post tasks
            let Some(task) = self.tasks.borrow_mut().pop_front() else {
                return executed;
            };
            task();
            executed += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }
}

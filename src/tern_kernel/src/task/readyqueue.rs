//! Task ready queue implementation (internal use only).
//!
//! The ready queue is a single intrusive doubly-linked list of task control
//! blocks, sorted by effective priority in descending order with FIFO
//! ordering inside a priority band. This gives O(1) dispatch and removal
//! and O(n) insertion, which is the right trade-off when the busy priority
//! bands are few.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading,
};

/// Get a `ListAccessorCell` used to access the ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |task_cb| &task_cb.ready_link, $key)
    };
}

/// The scheduling decision made by [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should continue to schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// Tracks the list of Ready tasks, sorted by effective priority.
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Get the effective priority of the task at the front of the queue.
    pub(crate) fn front_priority(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<u8> {
        let accessor = list_accessor!(&self.head, lock.borrow_mut());
        accessor
            .front_data()
            .map(|task_cb| task_cb.effective_priority.get(&**accessor.cell_key()))
    }

    /// Insert `task_cb` at the back of its priority band: after every task
    /// whose effective priority is greater than or equal to `task_cb`'s.
    ///
    /// `task_cb` must not be in the queue.
    pub(crate) fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        self.insert_task(lock.borrow_mut(), task_cb, false);
    }

    /// Insert `task_cb` at the front of its priority band: before every task
    /// whose effective priority is less than or equal to `task_cb`'s.
    ///
    /// `task_cb` must not be in the queue.
    pub(crate) fn push_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        self.insert_task(lock.borrow_mut(), task_cb, true);
    }

    fn insert_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        front_of_band: bool,
    ) {
        let priority = task_cb.effective_priority.get(&*lock);
        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());

        // Find the first task before which `task_cb` may be inserted without
        // violating the descending priority order.
        let mut insert_at = accessor.front();
        while let Some(cursor) = insert_at {
            let cursor_priority = accessor.pool()[cursor]
                .effective_priority
                .get(&**accessor.cell_key());
            let passes = if front_of_band {
                cursor_priority > priority
            } else {
                cursor_priority >= priority
            };
            if passes {
                insert_at = accessor.next(cursor);
            } else {
                break;
            }
        }

        accessor.insert(Ident(task_cb), insert_at);
    }

    /// Remove `task_cb` from the queue. `task_cb` must be in the queue.
    pub(crate) fn remove_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
        accessor.remove(Ident(task_cb));
    }

    /// Choose the next task to schedule.
    ///
    /// `prev_task_priority` is the effective priority of the task that would
    /// keep running if no switch happened, or `None` if there's no such task
    /// (the current task is blocked or terminated, or there is no current
    /// task). When `Keep` is returned the queue is unchanged; when
    /// `SwitchTo(Some(task))` is returned, `task` has been removed from the
    /// queue.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: Option<u8>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>> {
        let front_priority = self.front_priority(lock.borrow_mut());

        if let Some(prev) = prev_task_priority {
            match front_priority {
                // The current task can keep running
                Some(front) if front <= prev => return ScheduleDecision::Keep,
                None => return ScheduleDecision::Keep,
                Some(_) => {}
            }
        }

        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
        ScheduleDecision::SwitchTo(accessor.pop_front().map(|ident| ident.0))
    }

    /// Reposition `task_cb` after a change in its effective priority.
    ///
    /// `front_of_band` selects whether the task lands at the head or the
    /// tail of its new priority band.
    pub(crate) fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        front_of_band: bool,
    ) {
        self.remove_task(lock.borrow_mut(), task_cb);
        self.insert_task(lock.borrow_mut(), task_cb, front_of_band);
    }
}

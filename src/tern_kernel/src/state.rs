use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// Only a task context is waitable; the boot phase, interrupt handlers, and
/// timer callbacks must never block.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_task_context::<Traits>()
}

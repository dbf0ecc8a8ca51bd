//! Training/evaluation mode flag with a scoped evaluation context.

use std::cell::Cell;

/// Metric prefix used while the optimizer is in training mode.
pub const TRAIN_TASKS: &str = "train_tasks";
/// Metric prefix used while the optimizer is in evaluation mode.
pub const VAL_TASKS: &str = "val_tasks";

/// Training/evaluation flag of a meta-optimizer.
#[derive(Debug)]
pub struct ModeFlag {
    training: Cell<bool>,
}

impl ModeFlag {
    pub fn new(training: bool) -> Self {
        Self {
            training: Cell::new(training),
        }
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn set(&self, training: bool) {
        self.training.set(training);
    }

    /// `train_tasks` or `val_tasks`, depending on the current mode.
    pub fn prefix(&self) -> &'static str {
        if self.is_training() {
            TRAIN_TASKS
        } else {
            VAL_TASKS
        }
    }

    /// Forces evaluation mode until the returned guard is dropped.
    ///
    /// The mode active at this call is restored on drop, including on early
    /// returns and unwinding.
    pub fn eval_scope(&self) -> EvalScope<'_> {
        let prior = self.training.replace(false);
        EvalScope { flag: self, prior }
    }
}

impl Default for ModeFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Guard returned by [`ModeFlag::eval_scope`].
#[must_use = "evaluation mode ends as soon as the scope is dropped"]
#[derive(Debug)]
pub struct EvalScope<'a> {
    flag: &'a ModeFlag,
    prior: bool,
}

impl EvalScope<'_> {
    /// Mode that will be restored when the scope ends.
    pub fn prior(&self) -> bool {
        self.prior
    }
}

impl Drop for EvalScope<'_> {
    fn drop(&mut self) {
        self.flag.training.set(self.prior);
    }
}

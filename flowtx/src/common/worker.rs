use std::fmt::{Display, Formatter};
use std::thread::{self, ThreadId};

/// Identity of the worker executing a unit of work.
///
/// Workers are threads. Registry slots are keyed by this id and only
/// ever touched by the worker they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(ThreadId);

impl WorkerId {
    #[inline]
    pub fn current() -> Self {
        WorkerId(thread::current().id())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

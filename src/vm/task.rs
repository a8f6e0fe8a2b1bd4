// Strand Task Manager
// Host side scheduling of tickable work

use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use super::fiber::FiberId;
use super::vm::Vm;
use crate::config::VmConfig;
use crate::error::StrandResult;

/// Work advanced one step per tick
pub trait Task {
    /// Returns true while the task has more to do
    fn tick(&mut self) -> StrandResult<bool>;
    fn stop(&mut self);
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<Box<dyn Task>>,
    /// Only the first unfinished task gets ticked
    sequential: bool,
}

impl TaskManager {
    pub fn new(sequential: bool) -> Self {
        Self {
            tasks: Vec::new(),
            sequential,
        }
    }

    pub fn from_config(config: &VmConfig) -> Self {
        Self::new(config.sequential_tasks)
    }

    pub fn add(&mut self, task: Box<dyn Task>) {
        self.tasks.push(task);
    }

    pub fn is_busy(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tick tasks in insertion order dropping the finished ones.
    ///
    /// A failing task stops every task before the error is returned.
    pub fn tick(&mut self) -> StrandResult<()> {
        let mut i = 0;
        while i < self.tasks.len() {
            match self.tasks[i].tick() {
                Ok(true) => {
                    if self.sequential {
                        break;
                    }
                    i += 1;
                }
                Ok(false) => {
                    self.tasks.remove(i);
                }
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stop all tasks, latest added first
    pub fn stop(&mut self) {
        debug!(tasks = self.tasks.len(), "stopping tasks");
        for task in self.tasks.iter_mut().rev() {
            task.stop();
        }
        self.tasks.clear();
    }
}

/// A VM fiber driven as a task
pub struct FiberTask {
    vm: Rc<RefCell<Vm>>,
    id: FiberId,
}

impl FiberTask {
    pub fn new(vm: Rc<RefCell<Vm>>, id: FiberId) -> Self {
        Self { vm, id }
    }

    /// Start `func` on `vm` and wrap the fiber
    pub fn start(vm: Rc<RefCell<Vm>>, func: &str) -> StrandResult<Self> {
        let id = vm.borrow_mut().start(func, Vec::new())?;
        Ok(Self::new(vm, id))
    }

    pub fn id(&self) -> FiberId {
        self.id
    }
}

impl Task for FiberTask {
    fn tick(&mut self) -> StrandResult<bool> {
        self.vm.borrow_mut().tick_fiber(self.id)
    }

    fn stop(&mut self) {
        let mut vm = self.vm.borrow_mut();
        // the fiber may already be gone after a fault
        if vm.is_running(self.id) {
            if let Err(e) = vm.stop(self.id) {
                warn!(fiber = self.id, error = %e, "fiber stop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Fault, StrandError};

    struct Countdown {
        left: u32,
        ticks: Rc<RefCell<Vec<&'static str>>>,
        name: &'static str,
        stopped: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Task for Countdown {
        fn tick(&mut self) -> StrandResult<bool> {
            self.ticks.borrow_mut().push(self.name);
            if self.left == 0 {
                return Err(StrandError::from(Fault::Native(format!("{} broke", self.name))));
            }
            self.left -= 1;
            Ok(self.left > 0)
        }

        fn stop(&mut self) {
            self.stopped.borrow_mut().push(self.name);
        }
    }

    fn countdown(
        name: &'static str,
        left: u32,
        ticks: &Rc<RefCell<Vec<&'static str>>>,
        stopped: &Rc<RefCell<Vec<&'static str>>>,
    ) -> Box<dyn Task> {
        Box::new(Countdown {
            left,
            ticks: ticks.clone(),
            name,
            stopped: stopped.clone(),
        })
    }

    #[test]
    fn test_finished_tasks_are_dropped() {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let stopped = Rc::new(RefCell::new(Vec::new()));
        let mut tm = TaskManager::new(false);
        tm.add(countdown("a", 1, &ticks, &stopped));
        tm.add(countdown("b", 2, &ticks, &stopped));

        tm.tick().unwrap();
        assert_eq!(tm.len(), 1);
        tm.tick().unwrap();
        assert!(!tm.is_busy());
        assert_eq!(*ticks.borrow(), vec!["a", "b", "b"]);
        assert!(stopped.borrow().is_empty());
    }

    #[test]
    fn test_sequential_starves_later_tasks() {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let stopped = Rc::new(RefCell::new(Vec::new()));
        let mut tm = TaskManager::new(true);
        tm.add(countdown("a", 3, &ticks, &stopped));
        tm.add(countdown("b", 1, &ticks, &stopped));

        tm.tick().unwrap();
        tm.tick().unwrap();
        assert_eq!(*ticks.borrow(), vec!["a", "a"]);

        // "a" finishes, "b" gets its turn within the same tick
        tm.tick().unwrap();
        assert_eq!(*ticks.borrow(), vec!["a", "a", "a", "b"]);
        assert!(!tm.is_busy());
    }

    #[test]
    fn test_sequential_ticks_only_the_head() {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let stopped = Rc::new(RefCell::new(Vec::new()));
        let mut tm = TaskManager::new(true);
        tm.add(countdown("a", u32::MAX, &ticks, &stopped));
        tm.add(countdown("b", 1, &ticks, &stopped));
        tm.add(countdown("c", 1, &ticks, &stopped));

        for _ in 0..10 {
            tm.tick().unwrap();
        }
        assert_eq!(*ticks.borrow(), vec!["a"; 10]);
        assert_eq!(tm.len(), 3);
        assert!(stopped.borrow().is_empty());
    }

    #[test]
    fn test_failure_stops_everything_in_reverse() {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let stopped = Rc::new(RefCell::new(Vec::new()));
        let mut tm = TaskManager::new(false);
        tm.add(countdown("a", 5, &ticks, &stopped));
        tm.add(countdown("b", 0, &ticks, &stopped));
        tm.add(countdown("c", 5, &ticks, &stopped));

        let err = tm.tick().unwrap_err();
        assert_eq!(err.cause, Fault::Native("b broke".to_string()));
        assert_eq!(*stopped.borrow(), vec!["c", "b", "a"]);
        assert!(tm.is_empty());
    }
}

// Strand Coroutines
// Cooperative units ticked by an execution state until they leave RUNNING

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use tracing::trace;

use super::defer::DeferBlock;
use super::exec::ExecState;
use super::paral::{Branch, ParalBlock};
use super::pool::{Pool, PoolStats};
use super::vm::Runtime;
use crate::error::{Fault, FaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Status {
    #[default]
    None,
    Running,
    Success,
    Failure,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::None => "NONE",
            Status::Running => "RUNNING",
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CoroutineKind {
    Branch,
    Paral,
    ParalAll,
    Suspend,
    Yield,
}

impl CoroutineKind {
    pub fn name(&self) -> &'static str {
        match self {
            CoroutineKind::Branch => "Branch",
            CoroutineKind::Paral => "Paral",
            CoroutineKind::ParalAll => "ParalAll",
            CoroutineKind::Suspend => "Suspend",
            CoroutineKind::Yield => "Yield",
        }
    }
}

impl fmt::Display for CoroutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug)]
pub enum Coroutine {
    Branch(Branch),
    /// First branch to finish decides
    Paral(ParalBlock),
    /// Every branch has to succeed
    ParalAll(ParalBlock),
    /// Never finishes on its own
    Suspend,
    /// Gives up exactly one tick
    Yield { first_time: bool },
}

impl Coroutine {
    pub fn new(kind: CoroutineKind) -> Self {
        match kind {
            CoroutineKind::Branch => Coroutine::Branch(Branch::default()),
            CoroutineKind::Paral => Coroutine::Paral(ParalBlock::default()),
            CoroutineKind::ParalAll => Coroutine::ParalAll(ParalBlock::default()),
            CoroutineKind::Suspend => Coroutine::Suspend,
            CoroutineKind::Yield => Coroutine::Yield { first_time: true },
        }
    }

    pub fn kind(&self) -> CoroutineKind {
        match self {
            Coroutine::Branch(_) => CoroutineKind::Branch,
            Coroutine::Paral(_) => CoroutineKind::Paral,
            Coroutine::ParalAll(_) => CoroutineKind::ParalAll,
            Coroutine::Suspend => CoroutineKind::Suspend,
            Coroutine::Yield { .. } => CoroutineKind::Yield,
        }
    }

    pub fn tick(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<Status> {
        match self {
            Coroutine::Branch(branch) => branch.tick(rt, ext),
            Coroutine::Paral(paral) => paral.tick_race(rt, ext),
            Coroutine::ParalAll(paral) => paral.tick_all(rt, ext),
            Coroutine::Suspend => Ok(Status::Running),
            Coroutine::Yield { first_time } => {
                if *first_time {
                    *first_time = false;
                    Ok(Status::Running)
                } else {
                    Ok(Status::Success)
                }
            }
        }
    }

    /// Called once right before the coroutine goes back to its pool
    pub fn cleanup(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<()> {
        match self {
            Coroutine::Branch(branch) => branch.cleanup(rt, ext),
            Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => paral.cleanup(rt, ext),
            Coroutine::Suspend => Ok(()),
            Coroutine::Yield { first_time } => {
                *first_time = true;
                Ok(())
            }
        }
    }

    pub(crate) fn init_block(&mut self, min_ip: i32, max_ip: i32) {
        if let Coroutine::Paral(paral) | Coroutine::ParalAll(paral) = self {
            paral.init(min_ip, max_ip);
        }
    }

    pub(crate) fn init_branch(&mut self, ext: &ExecState, min_ip: i32, max_ip: i32) -> FaultResult<()> {
        match self {
            Coroutine::Branch(branch) => branch.init(ext, min_ip, max_ip),
            other => Err(Fault::BadBlock(other.kind().to_string())),
        }
    }

    pub fn attach(&mut self, child: Box<Coroutine>) -> FaultResult<()> {
        match self {
            Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => {
                paral.attach(child);
                Ok(())
            }
            other => Err(Fault::BadBlock(format!("{} can't have branches", other.kind()))),
        }
    }

    pub fn add_defer(&mut self, defer: DeferBlock) -> FaultResult<()> {
        match self {
            Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => {
                paral.add_defer(defer);
                Ok(())
            }
            other => Err(Fault::BadBlock(format!("{} can't have defers", other.kind()))),
        }
    }

    pub fn children(&self) -> Vec<&Coroutine> {
        match self {
            Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => paral.branches().collect(),
            Coroutine::Branch(branch) => branch.exec.coroutine.as_deref().into_iter().collect(),
            Coroutine::Suspend | Coroutine::Yield { .. } => Vec::new(),
        }
    }

    /// Indented tree, depth first
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(0, &mut out);
        out
    }

    fn dump_into(&self, level: usize, out: &mut String) {
        out.push_str(&"  ".repeat(level));
        match self {
            Coroutine::Branch(branch) => {
                out.push_str(&format!("Branch {}..{}", branch.min_ip(), branch.max_ip()))
            }
            Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => out.push_str(&format!(
                "{} {}..{}",
                self.kind(),
                paral.min_ip(),
                paral.max_ip()
            )),
            _ => out.push_str(self.kind().name()),
        }
        out.push('\n');
        for child in self.children() {
            child.dump_into(level + 1, out);
        }
    }
}

/// Pool of pools, one per coroutine kind
#[derive(Debug, Default)]
pub struct CoroutinePool {
    pools: FxHashMap<CoroutineKind, Pool<Box<Coroutine>>>,
    news: usize,
    dels: usize,
}

impl CoroutinePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, kind: CoroutineKind) -> Box<Coroutine> {
        self.news += 1;
        trace!(%kind, "coroutine acquired");
        self.pools
            .entry(kind)
            .or_default()
            .acquire_with(|| Box::new(Coroutine::new(kind)))
    }

    /// Coroutine must already be cleaned up
    pub fn release(&mut self, coro: Box<Coroutine>) {
        self.dels += 1;
        let kind = coro.kind();
        trace!(%kind, "coroutine released");
        self.pools.entry(kind).or_default().release(coro);
    }

    pub fn stats(&self, kind: CoroutineKind) -> PoolStats {
        self.pools.get(&kind).map(|p| p.stats()).unwrap_or_default()
    }

    pub fn news(&self) -> usize {
        self.news
    }

    pub fn dels(&self) -> usize {
        self.dels
    }

    pub fn hits(&self) -> usize {
        self.pools.values().map(|p| p.hits()).sum()
    }

    pub fn miss(&self) -> usize {
        self.pools.values().map(|p| p.miss()).sum()
    }

    pub fn busy(&self) -> usize {
        self.pools.values().map(|p| p.busy()).sum()
    }

    pub fn clear(&mut self) {
        self.pools.clear();
        self.news = 0;
        self.dels = 0;
    }
}

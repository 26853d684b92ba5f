// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The realisation engine: a goal graph driven by a single cooperative
//! scheduler.
//!
//! A goal is a future result for a store object, either
//! "realise these outputs of this derivation" or "make this path valid
//! via a substituter". Goals live in an arena indexed by [`GoalId`];
//! edges between parents and children are id-based, and a key map
//! deduplicates goals so any derivation is in flight at most once no
//! matter how many requestors ask for it.
//!
//! The scheduler itself runs on one task. Quick steps (DB checks,
//! parsing, spawning children) happen inline; builds and substituter
//! downloads run as spawned tasks whose count is bounded by the
//! `max_jobs` and `substitution_jobs` budgets. A goal that has
//! dispatched work or spawned children simply stops being runnable
//! until a completion wakes it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use cantata_store_core::derivation::{
    self, BasicDerivation, Derivation, DerivationOutput,
};
use cantata_store_core::derived_path::{DerivedPath, OutputName, OutputSpec};
use cantata_store_core::store_path::StorePath;
use cantata_store_db::StoreDb;
use cantata_store_remote::protocol::types::{BuildMode, BuildResult, BuildStatus};
use cantata_utils_hash::Sha256;

use crate::build;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::pathlocks::PathLocks;
use crate::substituter::{SubstituterSource, substitute_path};
use crate::temproots::TempRoots;

pub type GoalId = usize;

/// The result a goal settles on; shared with every waiter.
#[derive(Debug, Clone)]
pub enum GoalOutcome {
    Success(BuildStatus),
    Failure {
        status: BuildStatus,
        error: Arc<DaemonError>,
    },
}

impl GoalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GoalOutcome::Success(_))
    }

    fn failed(error: DaemonError) -> Self {
        let status = match &error {
            DaemonError::HashMismatch { .. } | DaemonError::SizeMismatch { .. } => {
                BuildStatus::OutputRejected
            }
            DaemonError::NoSubstituters(_) | DaemonError::SubstitutersFailed(_) => {
                BuildStatus::TransientFailure
            }
            DaemonError::Interrupted => BuildStatus::MiscFailure,
            _ => BuildStatus::MiscFailure,
        };
        GoalOutcome::Failure {
            status,
            error: Arc::new(error),
        }
    }
}

enum DrvState {
    /// Ensure the derivation file itself is valid and parse it.
    Init,
    /// Waiting for the `.drv` to be substituted.
    LoadingDerivation,
    /// Substitution goals for the wanted outputs are in flight.
    SubstitutingOutputs,
    /// Goals for input derivations and input sources are in flight.
    RealisingInputs,
    /// The build task is running (or queued for a slot).
    Building,
}

struct DerivationGoal {
    drv_path: StorePath,
    wanted: OutputSpec,
    mode: BuildMode,
    state: DrvState,
    drv: Option<Derivation>,
    /// Children whose failure just means "we will build instead".
    optional_children: HashSet<GoalId>,
    locks: Option<PathLocks>,
}

struct SubstitutionGoal {
    path: StorePath,
}

enum GoalKind {
    Derivation(DerivationGoal),
    Substitution(SubstitutionGoal),
}

struct Goal {
    kind: GoalKind,
    /// Parents waiting on this goal.
    waiters: Vec<GoalId>,
    pending_children: usize,
    failed_children: Vec<GoalId>,
    outcome: Option<GoalOutcome>,
}

enum TaskResult {
    Build(DaemonResult<BuildResult>),
    Substitute(DaemonResult<()>),
}

/// Work dispatched but not yet running because its budget is full.
struct QueuedTask {
    goal: GoalId,
    task: Task,
}

enum Task {
    Build {
        drv_path: StorePath,
        drv: BasicDerivation,
        mode: BuildMode,
        drv_hash: Sha256,
    },
    Substitute {
        path: StorePath,
    },
}

pub struct Worker<S> {
    config: Arc<DaemonConfig>,
    db: Arc<Mutex<StoreDb>>,
    substituters: Arc<Vec<S>>,
}

impl<S: SubstituterSource + 'static> Worker<S> {
    pub fn new(
        config: Arc<DaemonConfig>,
        db: Arc<Mutex<StoreDb>>,
        substituters: Arc<Vec<S>>,
    ) -> Self {
        Worker {
            config,
            db,
            substituters,
        }
    }

    /// Realise every target; the request fails if any target's goal
    /// failed.
    pub async fn build_paths(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> DaemonResult<()> {
        let outcomes = self.run(targets, mode).await?;
        for (target, outcome) in outcomes {
            if let GoalOutcome::Failure { error, .. } = outcome {
                return Err(DaemonError::BuildFailed {
                    drv_path: match target {
                        DerivedPath::Built { drv_path, .. } => drv_path,
                        DerivedPath::Opaque(path) => path,
                    },
                    message: error.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Realise one derivation and report its result.
    pub async fn build_derivation_goal(
        &self,
        drv_path: &StorePath,
        wanted: OutputSpec,
        mode: BuildMode,
    ) -> DaemonResult<BuildResult> {
        let target = DerivedPath::Built {
            drv_path: drv_path.clone(),
            outputs: wanted,
        };
        let outcomes = self.run(std::slice::from_ref(&target), mode).await?;
        let (_, outcome) = outcomes.into_iter().next().expect("one target, one outcome");
        Ok(match outcome {
            GoalOutcome::Success(status) => BuildResult::new(status, String::new()),
            GoalOutcome::Failure { status, error } => {
                BuildResult::new(status, error.to_string())
            }
        })
    }

    /// Make one path valid, substituting if necessary.
    pub async fn ensure_path(&self, path: &StorePath) -> DaemonResult<()> {
        {
            let full = self.config.store_dir.print_path(path);
            let db = self.db.lock().await;
            if db.is_valid_path(&full)? {
                return Ok(());
            }
        }
        let target = DerivedPath::Opaque(path.clone());
        let outcomes = self.run(std::slice::from_ref(&target), BuildMode::Normal).await?;
        match outcomes.into_iter().next() {
            Some((_, GoalOutcome::Failure { error, .. })) => {
                Err(Arc::try_unwrap(error).unwrap_or_else(|arc| {
                    DaemonError::other(arc.to_string())
                }))
            }
            _ => Ok(()),
        }
    }

    async fn run(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> DaemonResult<Vec<(DerivedPath, GoalOutcome)>> {
        let mut scheduler = Scheduler {
            worker: self,
            goals: Vec::new(),
            keys: HashMap::new(),
            runnable: VecDeque::new(),
            running: JoinSet::new(),
            running_goals: HashSet::new(),
            queued: VecDeque::new(),
            building: 0,
            substituting: 0,
            temp_roots: TempRoots::open(&self.config.temproots_dir())?,
        };

        let mut top = Vec::new();
        for target in targets {
            let id = match target {
                DerivedPath::Opaque(path) => {
                    scheduler.substitution_goal(path.clone(), None)?
                }
                DerivedPath::Built { drv_path, outputs } => {
                    scheduler.derivation_goal(drv_path.clone(), outputs.clone(), mode, None)?
                }
            };
            top.push((target.clone(), id));
        }

        scheduler.drive().await?;

        Ok(top
            .into_iter()
            .map(|(target, id)| {
                let outcome = scheduler.goals[id]
                    .outcome
                    .clone()
                    .expect("finished scheduler leaves outcomes");
                (target, outcome)
            })
            .collect())
    }
}

struct Scheduler<'w, S> {
    worker: &'w Worker<S>,
    goals: Vec<Goal>,
    keys: HashMap<String, GoalId>,
    runnable: VecDeque<GoalId>,
    running: JoinSet<(GoalId, TaskResult)>,
    running_goals: HashSet<GoalId>,
    queued: VecDeque<QueuedTask>,
    building: usize,
    substituting: usize,
    temp_roots: TempRoots,
}

impl<'w, S: SubstituterSource + 'static> Scheduler<'w, S> {
    fn config(&self) -> &DaemonConfig {
        &self.worker.config
    }

    fn derivation_goal(
        &mut self,
        drv_path: StorePath,
        wanted: OutputSpec,
        mode: BuildMode,
        parent: Option<GoalId>,
    ) -> DaemonResult<GoalId> {
        let key = format!("d{}!{}", drv_path, wanted);
        self.goal_for_key(key, parent, || {
            GoalKind::Derivation(DerivationGoal {
                drv_path,
                wanted,
                mode,
                state: DrvState::Init,
                drv: None,
                optional_children: HashSet::new(),
                locks: None,
            })
        })
    }

    fn substitution_goal(
        &mut self,
        path: StorePath,
        parent: Option<GoalId>,
    ) -> DaemonResult<GoalId> {
        let key = format!("p{}", path);
        self.goal_for_key(key, parent, || {
            GoalKind::Substitution(SubstitutionGoal { path })
        })
    }

    /// Deduplicate on the key; a fresh goal becomes runnable, an
    /// existing one gets the parent as another waiter. A cycle through
    /// the dependency graph is an error.
    fn goal_for_key(
        &mut self,
        key: String,
        parent: Option<GoalId>,
        make: impl FnOnce() -> GoalKind,
    ) -> DaemonResult<GoalId> {
        if let Some(&existing) = self.keys.get(&key) {
            if let Some(parent) = parent {
                if self.is_ancestor(existing, parent) {
                    let path = match &self.goals[existing].kind {
                        GoalKind::Derivation(goal) => goal.drv_path.clone(),
                        GoalKind::Substitution(goal) => goal.path.clone(),
                    };
                    return Err(DaemonError::Cycle(path));
                }
                self.add_edge(parent, existing);
            }
            return Ok(existing);
        }

        let id = self.goals.len();
        self.goals.push(Goal {
            kind: make(),
            waiters: Vec::new(),
            pending_children: 0,
            failed_children: Vec::new(),
            outcome: None,
        });
        self.keys.insert(key, id);
        if let Some(parent) = parent {
            self.add_edge(parent, id);
        }
        self.runnable.push_back(id);
        trace!(goal = id, "created goal");
        Ok(id)
    }

    /// Whether `candidate` lies on the parent chain of `goal`
    /// (inclusive). Completed goals drop their waiter edges, so only
    /// live dependency chains count.
    fn is_ancestor(&self, candidate: GoalId, goal: GoalId) -> bool {
        let mut stack = vec![goal];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == candidate {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.goals[current].waiters.iter().copied());
            }
        }
        false
    }

    /// A goal that spawned children may find them all already settled
    /// (deduplicated against finished goals); it then steps again
    /// immediately instead of waiting for a wake-up that will never
    /// come.
    fn requeue_if_unblocked(&mut self, id: GoalId) {
        if self.goals[id].pending_children == 0 && self.goals[id].outcome.is_none() {
            self.runnable.push_back(id);
        }
    }

    fn add_edge(&mut self, parent: GoalId, child: GoalId) {
        if self.goals[child].outcome.is_some() {
            if !self.goals[child].outcome.as_ref().unwrap().is_success() {
                self.goals[parent].failed_children.push(child);
            }
            return;
        }
        self.goals[child].waiters.push(parent);
        self.goals[parent].pending_children += 1;
    }

    fn complete(&mut self, id: GoalId, outcome: GoalOutcome) {
        trace!(goal = id, success = outcome.is_success(), "goal done");
        let waiters = std::mem::take(&mut self.goals[id].waiters);
        let failed = !outcome.is_success();
        self.goals[id].outcome = Some(outcome);
        // Locks and intermediate state go with the goal.
        if let GoalKind::Derivation(goal) = &mut self.goals[id].kind {
            goal.locks = None;
            goal.drv = None;
        }
        for waiter in waiters {
            if failed {
                self.goals[waiter].failed_children.push(id);
            }
            self.goals[waiter].pending_children -= 1;
            if self.goals[waiter].pending_children == 0 {
                self.runnable.push_back(waiter);
            }
        }
    }

    /// Drive every goal to completion.
    async fn drive(&mut self) -> DaemonResult<()> {
        loop {
            while let Some(id) = self.runnable.pop_front() {
                // Stale queue entries: already settled, currently
                // executing, or re-queued while still waiting.
                if self.goals[id].outcome.is_some()
                    || self.running_goals.contains(&id)
                    || self.goals[id].pending_children > 0
                {
                    continue;
                }
                self.step(id).await?;
            }
            self.dispatch_queued();

            if self.running.is_empty() {
                break;
            }
            let joined = self
                .running
                .join_next()
                .await
                .expect("non-empty join set yields");
            let (id, result) = joined.map_err(|e| DaemonError::other(format!("task panic: {e}")))?;
            self.running_goals.remove(&id);
            self.on_task_done(id, result);
        }

        // Anything still unfinished at this point is stuck behind an
        // impossible dependency.
        for id in 0..self.goals.len() {
            if self.goals[id].outcome.is_none() {
                warn!(goal = id, "goal never completed");
                self.goals[id].outcome = Some(GoalOutcome::failed(DaemonError::other(
                    "goal stuck on unfinished dependencies",
                )));
            }
        }
        Ok(())
    }

    fn dispatch_queued(&mut self) {
        let mut remaining = VecDeque::new();
        while let Some(queued) = self.queued.pop_front() {
            let slot_free = match &queued.task {
                Task::Build { .. } => self.building < self.config().max_jobs,
                Task::Substitute { .. } => {
                    self.substituting < self.config().substitution_jobs
                }
            };
            if slot_free {
                self.start_task(queued.goal, queued.task);
            } else {
                remaining.push_back(queued);
            }
        }
        self.queued = remaining;
    }

    fn start_task(&mut self, goal: GoalId, task: Task) {
        let config = Arc::clone(&self.worker.config);
        let db = Arc::clone(&self.worker.db);
        let substituters = Arc::clone(&self.worker.substituters);
        self.running_goals.insert(goal);
        match task {
            Task::Build {
                drv_path,
                drv,
                mode,
                drv_hash,
            } => {
                self.building += 1;
                self.running.spawn(async move {
                    let result = build::build_derivation(
                        &config,
                        &db,
                        &drv_path,
                        &drv,
                        mode,
                        Some(drv_hash),
                    )
                    .await;
                    (goal, TaskResult::Build(result))
                });
            }
            Task::Substitute { path } => {
                self.substituting += 1;
                self.running.spawn(async move {
                    let result = substitute_path(&config, &db, &substituters, &path).await;
                    (goal, TaskResult::Substitute(result))
                });
            }
        }
    }

    fn on_task_done(&mut self, id: GoalId, result: TaskResult) {
        match result {
            TaskResult::Build(result) => {
                self.building -= 1;
                let outcome = match result {
                    Ok(build_result) if build_result.success() => {
                        GoalOutcome::Success(build_result.status)
                    }
                    Ok(build_result) => GoalOutcome::Failure {
                        status: build_result.status,
                        error: Arc::new(DaemonError::BuildFailed {
                            drv_path: match &self.goals[id].kind {
                                GoalKind::Derivation(goal) => goal.drv_path.clone(),
                                GoalKind::Substitution(goal) => goal.path.clone(),
                            },
                            message: build_result.error_msg,
                        }),
                    },
                    Err(error) => GoalOutcome::failed(error),
                };
                self.complete(id, outcome);
            }
            TaskResult::Substitute(result) => {
                self.substituting -= 1;
                let outcome = match result {
                    Ok(()) => GoalOutcome::Success(BuildStatus::Substituted),
                    Err(error) => GoalOutcome::failed(error),
                };
                self.complete(id, outcome);
            }
        }
    }

    async fn step(&mut self, id: GoalId) -> DaemonResult<()> {
        match &self.goals[id].kind {
            GoalKind::Substitution(_) => self.step_substitution(id).await,
            GoalKind::Derivation(_) => self.step_derivation(id).await,
        }
    }

    async fn step_substitution(&mut self, id: GoalId) -> DaemonResult<()> {
        let path = match &self.goals[id].kind {
            GoalKind::Substitution(goal) => goal.path.clone(),
            _ => unreachable!("substitution step on derivation goal"),
        };
        let valid = {
            let full = self.config().store_dir.print_path(&path);
            let db = self.worker.db.lock().await;
            db.is_valid_path(&full)?
        };
        if valid {
            self.complete(id, GoalOutcome::Success(BuildStatus::AlreadyValid));
            return Ok(());
        }
        self.temp_roots
            .add(&self.config().store_dir.print_path(&path))?;
        self.queued.push_back(QueuedTask {
            goal: id,
            task: Task::Substitute { path },
        });
        Ok(())
    }

    async fn step_derivation(&mut self, id: GoalId) -> DaemonResult<()> {
        // Decide from a snapshot, then mutate; the arena cannot be
        // borrowed across child creation.
        enum Phase {
            Init,
            AfterLoad,
            AfterOutputSubstitution,
            AfterInputs,
        }
        let phase = match &self.goals[id].kind {
            GoalKind::Derivation(goal) => match goal.state {
                DrvState::Init => Phase::Init,
                DrvState::LoadingDerivation => Phase::AfterLoad,
                DrvState::SubstitutingOutputs => Phase::AfterOutputSubstitution,
                DrvState::RealisingInputs => Phase::AfterInputs,
                DrvState::Building => return Ok(()),
            },
            _ => unreachable!("derivation step on substitution goal"),
        };

        match phase {
            Phase::Init => {
                let drv_path = self.drv_goal(id).drv_path.clone();
                let valid = {
                    let full = self.config().store_dir.print_path(&drv_path);
                    let db = self.worker.db.lock().await;
                    db.is_valid_path(&full)?
                };
                let on_disk = self.config().store_dir.real_path(&drv_path).exists();
                self.drv_goal_mut(id).state = DrvState::LoadingDerivation;
                if !(valid || on_disk) {
                    let child = self.substitution_goal(drv_path, Some(id))?;
                    trace!(goal = id, child, "fetching derivation file");
                }
                self.requeue_if_unblocked(id);
                Ok(())
            }
            Phase::AfterLoad => {
                let drv_path = self.drv_goal(id).drv_path.clone();
                if !self.goals[id].failed_children.is_empty() {
                    let failed = std::mem::take(&mut self.goals[id].failed_children);
                    let outcome = self.dependency_failure(&drv_path, &failed);
                    self.complete(id, outcome);
                    return Ok(());
                }
                let real = self.config().store_dir.real_path(&drv_path);
                let text = tokio::fs::read_to_string(&real).await?;
                let drv = derivation::aterm::parse(
                    &self.config().store_dir,
                    &text,
                    drv_path.derivation_name(),
                )
                .map_err(|e| DaemonError::other(format!("parsing '{}': {e}", drv_path)))?;
                self.drv_goal_mut(id).drv = Some(drv);

                // Try substituting the wanted outputs whose paths are
                // already known, unless we are rebuilding anyway.
                let mode = self.drv_goal(id).mode;
                let mut to_substitute = Vec::new();
                if mode == BuildMode::Normal && !self.worker.substituters.is_empty() {
                    let goal = self.drv_goal(id);
                    let drv = goal.drv.as_ref().unwrap();
                    for (name, output) in &drv.outputs {
                        if !goal.wanted.contains(name) {
                            continue;
                        }
                        if let Some(path) =
                            output.path(&self.config().store_dir, &drv.name, name)?
                        {
                            to_substitute.push(path);
                        }
                    }
                }
                self.drv_goal_mut(id).state = DrvState::SubstitutingOutputs;
                for path in to_substitute {
                    let child = self.substitution_goal(path, Some(id))?;
                    self.drv_goal_mut(id).optional_children.insert(child);
                }
                self.requeue_if_unblocked(id);
                Ok(())
            }
            Phase::AfterOutputSubstitution => {
                // Output substitution failures are recoverable: forget
                // them and build.
                let optional = self.drv_goal(id).optional_children.clone();
                self.goals[id]
                    .failed_children
                    .retain(|child| !optional.contains(child));

                let mode = self.drv_goal(id).mode;
                if mode == BuildMode::Normal && self.wanted_outputs_valid(id).await? {
                    self.complete(id, GoalOutcome::Success(BuildStatus::Substituted));
                    return Ok(());
                }

                let (input_drvs, input_srcs) = {
                    let drv = self.drv_goal(id).drv.as_ref().unwrap();
                    (drv.input_drvs.clone(), drv.input_srcs.clone())
                };
                self.drv_goal_mut(id).state = DrvState::RealisingInputs;
                for (input_drv, outputs) in input_drvs {
                    let wanted = OutputSpec::Named(outputs.into_iter().collect());
                    self.derivation_goal(input_drv, wanted, BuildMode::Normal, Some(id))?;
                }
                for src in input_srcs {
                    let valid = {
                        let full = self.config().store_dir.print_path(&src);
                        let db = self.worker.db.lock().await;
                        db.is_valid_path(&full)? || self.config().store_dir.real_path(&src).exists()
                    };
                    if !valid {
                        self.substitution_goal(src, Some(id))?;
                    }
                }
                self.requeue_if_unblocked(id);
                Ok(())
            }
            Phase::AfterInputs => {
                let drv_path = self.drv_goal(id).drv_path.clone();
                if !self.goals[id].failed_children.is_empty() {
                    let failed = std::mem::take(&mut self.goals[id].failed_children);
                    let outcome = self.dependency_failure(&drv_path, &failed);
                    self.complete(id, outcome);
                    return Ok(());
                }

                let (resolved, drv_hash) = self.resolve(id).await?;

                // Output paths get locked (in sorted order) for the
                // whole build + registration, and protected from the
                // collector.
                let output_paths = resolved.output_paths(&self.config().store_dir)?;
                let real_paths: Vec<_> = output_paths
                    .iter()
                    .map(|(_, path)| self.config().store_dir.real_path(path))
                    .collect();
                for (_, path) in &output_paths {
                    self.temp_roots
                        .add(&self.config().store_dir.print_path(path))?;
                }
                let locks = tokio::task::spawn_blocking(move || {
                    PathLocks::lock_paths(&real_paths, true)
                })
                .await
                .map_err(|e| DaemonError::other(format!("lock task: {e}")))??
                .expect("blocking lock acquisition");

                let mode = self.drv_goal(id).mode;
                {
                    let goal = self.drv_goal_mut(id);
                    goal.locks = Some(locks);
                    goal.state = DrvState::Building;
                }
                debug!(%drv_path, "inputs realised, scheduling build");
                self.queued.push_back(QueuedTask {
                    goal: id,
                    task: Task::Build {
                        drv_path,
                        drv: resolved,
                        mode,
                        drv_hash,
                    },
                });
                Ok(())
            }
        }
    }

    fn dependency_failure(&self, drv_path: &StorePath, failed: &[GoalId]) -> GoalOutcome {
        let first = failed.first().and_then(|child| {
            self.goals[*child].outcome.as_ref().map(|outcome| match outcome {
                GoalOutcome::Failure { error, .. } => error.to_string(),
                GoalOutcome::Success(_) => String::new(),
            })
        });
        GoalOutcome::Failure {
            status: BuildStatus::DependencyFailed,
            error: Arc::new(DaemonError::BuildFailed {
                drv_path: drv_path.clone(),
                message: format!(
                    "{} dependencies failed{}",
                    failed.len(),
                    first.map(|m| format!("; first: {m}")).unwrap_or_default()
                ),
            }),
        }
    }

    async fn wanted_outputs_valid(&self, id: GoalId) -> DaemonResult<bool> {
        let goal = self.drv_goal(id);
        let drv = goal.drv.as_ref().unwrap();
        let db = self.worker.db.lock().await;
        for (name, output) in &drv.outputs {
            if !goal.wanted.contains(name) {
                continue;
            }
            match output.path(&self.config().store_dir, &drv.name, name)? {
                Some(path) => {
                    let full = self.config().store_dir.print_path(&path);
                    if !db.is_valid_path(&full)? {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Resolve the goal's derivation against its realised inputs,
    /// memoising the successor mapping.
    async fn resolve(&self, id: GoalId) -> DaemonResult<(BasicDerivation, Sha256)> {
        let goal = self.drv_goal(id);
        let drv = goal.drv.as_ref().unwrap();
        let store_dir = &self.config().store_dir;

        // Collect the realised output path of every input derivation
        // output from the database.
        let mut realised: BTreeMap<(StorePath, OutputName), StorePath> = BTreeMap::new();
        {
            let db = self.worker.db.lock().await;
            for (input_drv, outputs) in &drv.input_drvs {
                let input_text =
                    tokio::fs::read_to_string(store_dir.real_path(input_drv)).await?;
                let input = derivation::aterm::parse(
                    store_dir,
                    &input_text,
                    input_drv.derivation_name(),
                )
                .map_err(|e| DaemonError::other(format!("parsing '{input_drv}': {e}")))?;
                for output in outputs {
                    let path = match input.outputs.get(output) {
                        Some(DerivationOutput::CAFloating(_)) | Some(DerivationOutput::Deferred) => {
                            // Learned at build time; look up the
                            // recorded output.
                            db.query_derivation_outputs(&store_dir.print_path(input_drv))?
                                .into_iter()
                                .find(|row| row.output_name == output.as_str())
                                .and_then(|row| store_dir.parse_path(&row.path).ok())
                        }
                        Some(out) => out.path(store_dir, &input.name, output)?,
                        None => None,
                    };
                    let path = path.ok_or_else(|| {
                        DaemonError::Derivation(
                            cantata_store_core::derivation::DerivationError::NotYetResolvable {
                                drv_path: input_drv.clone(),
                                output: output.clone(),
                            },
                        )
                    })?;
                    realised.insert((input_drv.clone(), output.clone()), path);
                }
            }
        }

        let resolved = drv.resolve(
            |drv_path, output| realised.get(&(drv_path.clone(), output.clone())).cloned(),
            &BTreeMap::new(),
        )?;

        // The resolved text is stable now; its hash keys realisations
        // and the successor table.
        let resolved_full = Derivation {
            name: resolved.name.clone(),
            outputs: resolved.outputs.clone(),
            input_srcs: resolved.inputs.clone(),
            input_drvs: BTreeMap::new(),
            platform: resolved.platform.clone(),
            builder: resolved.builder.clone(),
            args: resolved.args.clone(),
            env: resolved.env.clone(),
        };
        let resolved_text = derivation::aterm::unparse(store_dir, &resolved_full);
        let drv_hash = Sha256::digest(&resolved_text);

        if !drv.input_drvs.is_empty() {
            let resolved_path = store_dir.make_text_path(
                &format!("{}.drv", resolved.name),
                &drv_hash,
                &BTreeSet::new(),
            )?;
            let db = self.worker.db.lock().await;
            db.register_successor(
                &store_dir.print_path(&goal.drv_path),
                &store_dir.print_path(&resolved_path),
            )?;
        }

        Ok((resolved, drv_hash))
    }

    fn drv_goal(&self, id: GoalId) -> &DerivationGoal {
        match &self.goals[id].kind {
            GoalKind::Derivation(goal) => goal,
            _ => unreachable!("goal {id} is not a derivation goal"),
        }
    }

    fn drv_goal_mut(&mut self, id: GoalId) -> &mut DerivationGoal {
        match &mut self.goals[id].kind {
            GoalKind::Derivation(goal) => goal,
            _ => unreachable!("goal {id} is not a derivation goal"),
        }
    }
}

//! Validated pipeline graph
//!
//! [`PipelineGraph::from_config`] is the only way to obtain a graph, and it
//! performs every check up front: a graph that exists is acyclic, all of its
//! references resolve and every pattern compiles.

use crate::core::config::{JobConfig, PipelineConfig, RetryConfig, StepConfig};
use crate::core::error::DefinitionError;
use crate::core::job::{Backoff, Job, JobId, RetryPolicy, Step, StepAction};
use crate::core::trigger::TriggerFilter;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;

/// An immutable, acyclic job graph ready to be run
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// Pipeline name
    name: String,

    /// Jobs, indexed by [`JobId`]
    jobs: Vec<Job>,

    /// Job name -> id
    index: HashMap<String, JobId>,

    /// Reverse adjacency: jobs that depend on each job
    dependents: Vec<Vec<JobId>>,

    /// Dependencies before dependents, declaration order among peers
    topo_order: Vec<JobId>,

    group_limits: BTreeMap<String, usize>,
    max_parallel: Option<usize>,
    variables: HashMap<String, String>,
    env: BTreeMap<String, String>,
    gate_timeout: Option<Duration>,
}

fn identifier_regex() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("valid identifier regex"))
}

fn is_valid_artifact_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

impl PipelineGraph {
    /// Build and validate the graph described by a configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self, DefinitionError> {
        if config.jobs.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let index = Self::index_jobs(&config.jobs)?;
        let group_limits = Self::validate_group_limits(config)?;
        let default_timeout = config.defaults.timeout_secs.map(Duration::from_secs);

        let mut jobs = Vec::with_capacity(config.jobs.len());
        for (i, job_config) in config.jobs.iter().enumerate() {
            jobs.push(Self::build_job(JobId(i), job_config, &index, default_timeout)?);
        }

        let mut dependents = vec![Vec::new(); jobs.len()];
        for job in &jobs {
            for dep in &job.dependencies {
                dependents[dep.0].push(job.id);
            }
        }

        let topo_order = Self::topological_sort(&jobs, &dependents)?;
        Self::resolve_artifacts(&jobs, &topo_order)?;

        Ok(Self {
            name: config.name.clone(),
            jobs,
            index,
            dependents,
            topo_order,
            group_limits,
            max_parallel: config.concurrency.max_parallel.filter(|n| *n > 0),
            variables: config.variables_as_string_map(),
            env: config.env.clone(),
            gate_timeout: config.defaults.gate_timeout_secs.map(Duration::from_secs),
        })
    }

    fn index_jobs(configs: &[JobConfig]) -> Result<HashMap<String, JobId>, DefinitionError> {
        let mut index = HashMap::with_capacity(configs.len());
        for (i, job) in configs.iter().enumerate() {
            let field = format!("jobs[{}].name", i);
            if job.name.trim().is_empty() {
                return Err(DefinitionError::MissingJobName { field });
            }
            if index.insert(job.name.clone(), JobId(i)).is_some() {
                return Err(DefinitionError::DuplicateJobName {
                    job: job.name.clone(),
                    field,
                });
            }
        }
        Ok(index)
    }

    fn validate_group_limits(
        config: &PipelineConfig,
    ) -> Result<BTreeMap<String, usize>, DefinitionError> {
        for (group, limit) in &config.concurrency.groups {
            if !identifier_regex().is_match(group) || *limit == 0 {
                return Err(DefinitionError::InvalidConcurrencyGroup {
                    job: config.name.clone(),
                    field: format!("concurrency.groups.{}", group),
                    group: group.clone(),
                });
            }
        }
        Ok(config.concurrency.groups.clone())
    }

    fn build_job(
        id: JobId,
        config: &JobConfig,
        index: &HashMap<String, JobId>,
        default_timeout: Option<Duration>,
    ) -> Result<Job, DefinitionError> {
        let name = config.name.clone();

        let mut dependencies: Vec<JobId> = Vec::with_capacity(config.depends_on.len());
        for (i, dep) in config.depends_on.iter().enumerate() {
            let dep_id = index.get(dep).copied().ok_or_else(|| DefinitionError::UnknownDependency {
                job: name.clone(),
                field: format!("dependsOn[{}]", i),
                dependency: dep.clone(),
            })?;
            if dep_id == id {
                return Err(DefinitionError::CyclicGraph {
                    cycle: vec![name.clone()],
                });
            }
            if !dependencies.contains(&dep_id) {
                dependencies.push(dep_id);
            }
        }

        let trigger = match &config.trigger {
            Some(trigger) => TriggerFilter::compile(&name, trigger)?,
            None => TriggerFilter::default(),
        };

        if let Some(group) = &config.concurrency_group {
            if !identifier_regex().is_match(group) {
                return Err(DefinitionError::InvalidConcurrencyGroup {
                    job: name.clone(),
                    field: "concurrencyGroup".to_string(),
                    group: group.clone(),
                });
            }
        }

        if config.steps.is_empty() {
            return Err(DefinitionError::InvalidStep {
                job: name.clone(),
                field: "steps".to_string(),
                message: "job has no steps".to_string(),
            });
        }
        let steps = config
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| Self::build_step(&name, i, step))
            .collect::<Result<Vec<_>, _>>()?;

        for (kind, names) in [
            ("inputs", &config.artifacts.inputs),
            ("outputs", &config.artifacts.outputs),
        ] {
            for (i, artifact) in names.iter().enumerate() {
                if !is_valid_artifact_name(artifact) {
                    return Err(DefinitionError::InvalidArtifactName {
                        job: name.clone(),
                        field: format!("artifacts.{}[{}]", kind, i),
                        name: artifact.clone(),
                    });
                }
            }
        }

        let retry = match &config.retry {
            Some(retry) => Self::build_retry(&name, retry)?,
            None => RetryPolicy::none(),
        };

        Ok(Job {
            id,
            name,
            steps,
            dependencies,
            inputs: config.artifacts.inputs.clone(),
            outputs: config.artifacts.outputs.clone(),
            concurrency_group: config.concurrency_group.clone(),
            trigger,
            allow_failure: config.allow_failure,
            retry,
            timeout: config.timeout_secs.map(Duration::from_secs).or(default_timeout),
            env: config.env.clone(),
        })
    }

    fn build_step(job: &str, i: usize, config: &StepConfig) -> Result<Step, DefinitionError> {
        let invalid = |field: String, message: &str| DefinitionError::InvalidStep {
            job: job.to_string(),
            field,
            message: message.to_string(),
        };
        let field = format!("steps[{}]", i);

        let declared = [
            config.run.is_some(),
            config.upload.is_some(),
            config.download.is_some(),
            config.gate.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if declared != 1 {
            return Err(invalid(
                field,
                "exactly one of run, upload, download or gate must be set",
            ));
        }

        let check_artifact = |kind: &str, artifact: &str, path: &str| {
            if !is_valid_artifact_name(artifact) {
                return Err(DefinitionError::InvalidArtifactName {
                    job: job.to_string(),
                    field: format!("{}.{}.artifact", field, kind),
                    name: artifact.to_string(),
                });
            }
            if path.trim().is_empty() {
                return Err(invalid(format!("{}.{}.path", field, kind), "path is empty"));
            }
            Ok(())
        };

        let action = if let Some(command) = &config.run {
            if command.trim().is_empty() {
                return Err(invalid(format!("{}.run", field), "command is empty"));
            }
            StepAction::Run {
                command: command.clone(),
            }
        } else if let Some(upload) = &config.upload {
            check_artifact("upload", &upload.artifact, &upload.path)?;
            StepAction::Upload {
                artifact: upload.artifact.clone(),
                path: upload.path.clone(),
            }
        } else if let Some(download) = &config.download {
            check_artifact("download", &download.artifact, &download.path)?;
            StepAction::Download {
                artifact: download.artifact.clone(),
                path: download.path.clone(),
            }
        } else if let Some(gate) = &config.gate {
            if gate.name.trim().is_empty() {
                return Err(invalid(format!("{}.gate.name", field), "gate name is empty"));
            }
            StepAction::Gate {
                gate: gate.name.clone(),
                timeout: gate.timeout_secs.map(Duration::from_secs),
                command: gate.run.clone(),
            }
        } else {
            return Err(invalid(field, "step has no action"));
        };

        Ok(Step {
            name: config.name.clone().unwrap_or_else(|| action.default_name()),
            action,
            continue_on_error: config.continue_on_error,
            env: config.env.clone(),
        })
    }

    fn build_retry(job: &str, config: &RetryConfig) -> Result<RetryPolicy, DefinitionError> {
        let invalid = |field: &str, message: &str| DefinitionError::InvalidRetry {
            job: job.to_string(),
            field: field.to_string(),
            message: message.to_string(),
        };

        if config.attempts == 0 {
            return Err(invalid("retry.attempts", "attempts must be at least 1"));
        }
        let backoff = &config.backoff;
        if !backoff.factor.is_finite() || backoff.factor < 0.0 {
            return Err(invalid("retry.backoff.factor", "factor must be a non-negative number"));
        }
        let initial = Duration::try_from_secs_f64(backoff.initial_secs)
            .map_err(|_| invalid("retry.backoff.initialSecs", "delay must be a non-negative number"))?;
        let max = backoff
            .max_secs
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|_| invalid("retry.backoff.maxSecs", "delay must be a non-negative number"))?;

        Ok(RetryPolicy {
            attempts: config.attempts,
            backoff: Backoff {
                initial,
                factor: backoff.factor,
                max,
            },
        })
    }

    /// Kahn's algorithm; on failure one cycle is extracted for the diagnostic
    fn topological_sort(jobs: &[Job], dependents: &[Vec<JobId>]) -> Result<Vec<JobId>, DefinitionError> {
        let mut in_degree: Vec<usize> = jobs.iter().map(|j| j.dependencies.len()).collect();
        let mut queue: VecDeque<JobId> = jobs
            .iter()
            .filter(|j| j.dependencies.is_empty())
            .map(|j| j.id)
            .collect();
        let mut order = Vec::with_capacity(jobs.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dependent in &dependents[id.0] {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    queue.push_back(*dependent);
                }
            }
        }

        if order.len() == jobs.len() {
            return Ok(order);
        }

        Err(DefinitionError::CyclicGraph {
            cycle: Self::find_cycle(jobs, &in_degree),
        })
    }

    /// Every unsorted job has an unsorted dependency, so following them must revisit a job
    fn find_cycle(jobs: &[Job], in_degree: &[usize]) -> Vec<String> {
        let unsorted = |id: &JobId| in_degree[id.0] > 0;
        let Some(start) = jobs.iter().map(|j| j.id).find(|id| unsorted(id)) else {
            return Vec::new();
        };

        let mut path: Vec<JobId> = Vec::new();
        let mut seen: HashMap<JobId, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&pos) = seen.get(&current) {
                return path[pos..].iter().map(|id| jobs[id.0].name.clone()).collect();
            }
            seen.insert(current, path.len());
            path.push(current);
            match jobs[current.0].dependencies.iter().find(|d| unsorted(d)) {
                Some(next) => current = *next,
                None => return path.iter().map(|id| jobs[id.0].name.clone()).collect(),
            }
        }
    }

    /// Every consumed artifact must be produced by a transitive dependency
    fn resolve_artifacts(jobs: &[Job], topo_order: &[JobId]) -> Result<(), DefinitionError> {
        let mut ancestors: Vec<HashSet<JobId>> = vec![HashSet::new(); jobs.len()];
        for id in topo_order {
            let mut set = HashSet::new();
            for dep in &jobs[id.0].dependencies {
                set.insert(*dep);
                set.extend(ancestors[dep.0].iter().copied());
            }
            ancestors[id.0] = set;
        }

        for job in jobs {
            let produced_upstream = |artifact: &str| {
                ancestors[job.id.0]
                    .iter()
                    .any(|a| jobs[a.0].produced_artifacts().any(|p| p == artifact))
            };

            for (i, input) in job.inputs.iter().enumerate() {
                if !produced_upstream(input) {
                    return Err(DefinitionError::UnresolvedArtifact {
                        job: job.name.clone(),
                        field: format!("artifacts.inputs[{}]", i),
                        artifact: input.clone(),
                    });
                }
            }

            for (i, step) in job.steps.iter().enumerate() {
                if let StepAction::Download { artifact, .. } = &step.action {
                    let produced_earlier = job.steps[..i].iter().any(|s| {
                        matches!(&s.action, StepAction::Upload { artifact: a, .. } if a == artifact)
                    });
                    if !produced_earlier && !produced_upstream(artifact) {
                        return Err(DefinitionError::UnresolvedArtifact {
                            job: job.name.clone(),
                            field: format!("steps[{}].download.artifact", i),
                            artifact: artifact.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All jobs in declaration order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Get a job by id
    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    /// Look up a job id by name
    pub fn id_of(&self, name: &str) -> Option<JobId> {
        self.index.get(name).copied()
    }

    /// Get a job by name
    pub fn job_by_name(&self, name: &str) -> Option<&Job> {
        self.id_of(name).map(|id| self.job(id))
    }

    /// Jobs that directly depend on `id`
    pub fn dependents(&self, id: JobId) -> &[JobId] {
        &self.dependents[id.0]
    }

    /// Jobs in dependency order
    pub fn topological_order(&self) -> &[JobId] {
        &self.topo_order
    }

    /// Limit of a concurrency group; `None` means unlimited
    pub fn group_limit(&self, group: &str) -> Option<usize> {
        self.group_limits.get(group).copied()
    }

    pub fn group_limits(&self) -> &BTreeMap<String, usize> {
        &self.group_limits
    }

    /// Pipeline-wide bound on running jobs, if declared
    pub fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    /// Variables rendered into step commands
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Pipeline-wide environment
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Pipeline default for how long a gate may stay pending
    pub fn gate_timeout(&self) -> Option<Duration> {
        self.gate_timeout
    }
}

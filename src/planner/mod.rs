//! Execution Planner: classified request → plan.

pub mod graph;
pub mod skeleton;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use conductor_common::{
    ArtifactId, ClassifiedRequest, ComplexityTier, ExecutionPattern, InputRef, PhaseId, Plan,
    SchemaId, TaskId, TaskSpec,
};
use skeleton::{SUPPORTED_TAGS, clarification, skeleton, task_applies};

#[derive(Debug, Clone)]
pub struct Planner {
    confidence_threshold: f64,
    max_input_bytes: usize,
}

impl Planner {
    pub fn new(confidence_threshold: f64, max_input_bytes: usize) -> Self {
        Self {
            confidence_threshold,
            max_input_bytes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.confidence_threshold, config.max_input_bytes)
    }

    /// Look up the skeleton for a request.
    pub fn select_pattern(request: &ClassifiedRequest) -> EngineResult<ExecutionPattern> {
        let supported = supported_tags(request);
        if supported.is_empty() {
            let given: Vec<&str> = request.domain_tags.iter().map(String::as_str).collect();
            return Err(EngineError::NoApplicablePattern {
                reason: format!(
                    "no supported domain tag in {:?} (supported: {})",
                    given,
                    SUPPORTED_TAGS.join(", ")
                ),
            });
        }
        Ok(match request.complexity {
            ComplexityTier::Simple => ExecutionPattern::Standard,
            ComplexityTier::Medium => ExecutionPattern::Extended,
            ComplexityTier::Complex if supported.len() >= 2 => ExecutionPattern::Hierarchical,
            ComplexityTier::Complex => ExecutionPattern::Extended,
        })
    }

    /// First plan for a request.
    pub fn plan(&self, request: &ClassifiedRequest) -> EngineResult<Plan> {
        let pattern = Self::select_pattern(request)?;
        let mut phases = self.instantiate(pattern, request);
        if request.confidence < self.confidence_threshold {
            tracing::info!(
                confidence = request.confidence,
                threshold = self.confidence_threshold,
                "Ambiguous classification; plan starts with clarification"
            );
            phases.insert(0, clarification());
        }
        let plan = finish(Plan {
            version: 1,
            pattern,
            phases,
        })?;
        tracing::info!(pattern = %plan.pattern, phases = plan.phases.len(), tasks = plan.task_count(), "Plan created");
        Ok(plan)
    }

    /// New plan version keeping the first `keep` phases of `current` and
    /// re-deriving the rest from `request`.
    pub fn replan(&self, current: &Plan, keep: usize, request: &ClassifiedRequest) -> EngineResult<Plan> {
        let pattern = Self::select_pattern(request)?;
        let keep = keep.min(current.phases.len());
        let mut phases = current.phases[..keep].to_vec();
        let kept_ids: Vec<PhaseId> = phases.iter().map(|p| p.id.clone()).collect();
        phases.extend(
            self.instantiate(pattern, request)
                .into_iter()
                .filter(|p| !kept_ids.contains(&p.id)),
        );
        let plan = finish(Plan {
            version: current.version + 1,
            pattern,
            phases,
        })?;
        tracing::info!(version = plan.version, kept = keep, pattern = %plan.pattern, "Re-planned");
        Ok(plan)
    }

    /// New plan version with a revision of `target` appended to its phase.
    ///
    /// The revision has the target's producer, output schema and inputs,
    /// plus the target itself (pinned, so it reads the artifact being
    /// revised) and `attachment`. Downstream consumers of the target now
    /// resolve to the revision.
    pub fn revise(&self, current: &Plan, target: &TaskId, attachment: ArtifactId) -> EngineResult<(Plan, TaskId)> {
        let root = target.root();
        let base = current
            .task(&root)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown task {}", target)))?;
        let latest_id = current.latest_revision(&root);
        let latest = current
            .task(&latest_id)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown task {}", latest_id)))?;

        let n = current.revision_count(&root) + 1;
        let mut revision = base.clone();
        revision.id = TaskId::revision(&root, n);
        revision.revision_of = Some(latest_id.clone());
        revision.inputs.push(InputRef {
            task: latest_id.clone(),
            schema: latest.output.clone(),
            optional: false,
            pinned: true,
        });
        revision.attachments = vec![attachment];

        let mut plan = current.clone();
        plan.version += 1;
        let phase = plan
            .phases
            .iter_mut()
            .find(|p| p.id == base.phase)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown phase {}", base.phase)))?;
        let id = revision.id.clone();
        phase.tasks.push(revision);

        let plan = finish(plan)?;
        tracing::info!(version = plan.version, revision = %id, "Revision task added");
        Ok((plan, id))
    }

    /// Skeleton filtered to the request's tags, with inputs pruned to the
    /// tasks that remain.
    fn instantiate(&self, pattern: ExecutionPattern, request: &ClassifiedRequest) -> Vec<conductor_common::PhaseSpec> {
        let tags = supported_tags(request);
        let mut phases: Vec<_> = skeleton(pattern)
            .into_iter()
            .map(|template| {
                let mut spec = template.spec;
                spec.tasks.retain(|t| task_applies(t, &tags));
                if spec.tasks.is_empty()
                    && let Some(fallback) = template.fallback
                {
                    spec.tasks.push(fallback);
                }
                spec
            })
            .collect();

        let planned: Vec<TaskId> = phases
            .iter()
            .flat_map(|p| p.tasks.iter().map(|t| t.id.clone()))
            .collect();
        for task in phases.iter_mut().flat_map(|p| p.tasks.iter_mut()) {
            task.inputs.retain(|i| planned.contains(&i.task));
            task.max_input_bytes = Some(self.max_input_bytes);
        }
        phases
    }
}

fn supported_tags(request: &ClassifiedRequest) -> Vec<String> {
    request
        .domain_tags
        .iter()
        .filter(|t| SUPPORTED_TAGS.contains(&t.as_str()))
        .cloned()
        .collect()
}

/// Number phases and validate the result.
fn finish(mut plan: Plan) -> EngineResult<Plan> {
    for (i, phase) in plan.phases.iter_mut().enumerate() {
        phase.ordinal = i;
    }
    graph::validate(&plan).map_err(|e| EngineError::InvalidPlan(e.to_string()))?;
    Ok(plan)
}

/// Schema of the artifact a checkpoint modification request is stored as.
pub fn modification_schema() -> SchemaId {
    SchemaId::new("checkpoint.modification")
}

/// Schema of the artifact a clarification after a rejection is stored as.
pub fn clarification_schema() -> SchemaId {
    SchemaId::new("checkpoint.clarification")
}

/// Last task declared in `phase`, ignoring revisions. A modification
/// request without an explicit task targets it.
pub fn last_task(plan: &Plan, phase: &PhaseId) -> Option<TaskSpec> {
    plan.phase(phase)
        .and_then(|p| p.tasks.iter().rev().find(|t| t.revision_of.is_none()))
        .cloned()
}

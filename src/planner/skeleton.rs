//! Canonical phase skeletons.
//!
//! Each pattern is a fixed list of phases. Developer tasks carry a domain
//! tag and are filtered against the request when the plan is instantiated.

use conductor_common::{
    CheckpointRequirement, ExecutionPattern, InputRef, PhaseId, PhaseSpec, SchemaId, TaskId,
    TaskSpec,
};

/// Domain tags the planner knows how to staff.
pub const SUPPORTED_TAGS: &[&str] = &["backend", "frontend", "data", "cli", "infra", "security"];

/// Tag → producer building that part of the system.
const DEVELOPERS: &[(&str, &str)] = &[
    ("backend", "backend-developer"),
    ("frontend", "frontend-developer"),
    ("data", "data-engineer"),
    ("cli", "cli-developer"),
    ("infra", "infra-engineer"),
];

/// Untagged producer used when no developer tag matches.
const FALLBACK_DEVELOPER: &str = "software-developer";

pub const CLARIFICATION_PHASE: &str = "clarification";

/// A phase before tag filtering.
pub struct PhaseTemplate {
    pub spec: PhaseSpec,
    /// Replaces the tagged tasks when filtering leaves the phase empty
    pub fallback: Option<TaskSpec>,
}

impl PhaseTemplate {
    fn fixed(spec: PhaseSpec) -> Self {
        Self {
            spec,
            fallback: None,
        }
    }
}

fn input(phase: &str, producer: &str, schema: &str) -> InputRef {
    InputRef::required(
        TaskId::planned(&PhaseId::new(phase), producer),
        SchemaId::new(schema),
    )
}

fn optional_input(phase: &str, producer: &str, schema: &str) -> InputRef {
    InputRef::optional(
        TaskId::planned(&PhaseId::new(phase), producer),
        SchemaId::new(schema),
    )
}

fn requirements() -> PhaseTemplate {
    let id = PhaseId::new("requirements");
    PhaseTemplate::fixed(
        PhaseSpec::new("requirements", "Requirements")
            .with_task(TaskSpec::new(&id, "requirements-analyst", "requirements.spec")),
    )
}

fn research() -> PhaseTemplate {
    let id = PhaseId::new("research");
    let req = input("requirements", "requirements-analyst", "requirements.spec");
    PhaseTemplate::fixed(
        PhaseSpec::new("research", "Research")
            .with_task(
                TaskSpec::new(&id, "domain-researcher", "research.domain").with_input(req.clone()),
            )
            .with_task(
                TaskSpec::new(&id, "technology-researcher", "research.technology")
                    .with_input(req),
            ),
    )
}

fn architecture(with_research: bool, checkpoint: CheckpointRequirement) -> PhaseTemplate {
    let id = PhaseId::new("architecture");
    let mut architect = TaskSpec::new(&id, "architect", "architecture.design").with_input(input(
        "requirements",
        "requirements-analyst",
        "requirements.spec",
    ));
    if with_research {
        architect = architect
            .with_input(input("research", "domain-researcher", "research.domain"))
            .with_input(input(
                "research",
                "technology-researcher",
                "research.technology",
            ));
    }
    PhaseTemplate::fixed(
        PhaseSpec::new("architecture", "Architecture")
            .with_task(architect)
            .with_checkpoint(checkpoint),
    )
}

/// One tagged developer task per domain, all consuming `inputs`.
fn developers(phase: &str, name: &str, inputs: &[InputRef]) -> PhaseTemplate {
    let id = PhaseId::new(phase);
    let mut spec = PhaseSpec::new(phase, name);
    for (tag, producer) in DEVELOPERS {
        let mut task = TaskSpec::new(&id, producer, &format!("{}.{}", phase, tag)).tagged(tag);
        task.inputs = inputs.to_vec();
        spec = spec.with_task(task);
    }
    let mut fallback = TaskSpec::new(&id, FALLBACK_DEVELOPER, &format!("{}.code", phase));
    fallback.inputs = inputs.to_vec();
    PhaseTemplate {
        spec,
        fallback: Some(fallback),
    }
}

/// Inputs on every developer output of `phase`, pruned later to the
/// developers that survive filtering.
fn developer_outputs(phase: &str) -> Vec<InputRef> {
    let mut refs: Vec<InputRef> = DEVELOPERS
        .iter()
        .map(|(tag, producer)| input(phase, producer, &format!("{}.{}", phase, tag)))
        .collect();
    refs.push(input(phase, FALLBACK_DEVELOPER, &format!("{}.code", phase)));
    refs
}

fn verification(upstream: Vec<InputRef>) -> PhaseTemplate {
    let id = PhaseId::new("verification");
    let mut tester = TaskSpec::new(&id, "test-engineer", "verification.report");
    tester.inputs = upstream.clone();
    let mut security = TaskSpec::new(&id, "security-reviewer", "verification.security")
        .tagged("security")
        .skip_tolerant();
    security.inputs = upstream;
    PhaseTemplate::fixed(
        PhaseSpec::new("verification", "Verification")
            .with_task(tester)
            .with_task(security),
    )
}

fn documentation(upstream: Vec<InputRef>) -> PhaseTemplate {
    let id = PhaseId::new("documentation");
    let mut writer = TaskSpec::new(&id, "doc-writer", "documentation.guide").skip_tolerant();
    writer.inputs = upstream;
    writer.inputs.push(optional_input(
        "verification",
        "test-engineer",
        "verification.report",
    ));
    PhaseTemplate::fixed(
        PhaseSpec::new("documentation", "Documentation")
            .with_task(writer)
            .with_checkpoint(CheckpointRequirement::TerminalSummary),
    )
}

/// Leading phase with no tasks that blocks until a human disambiguates.
pub fn clarification() -> PhaseSpec {
    PhaseSpec::new(CLARIFICATION_PHASE, "Clarification")
        .with_checkpoint(CheckpointRequirement::Clarification)
}

/// Phase templates of a pattern, in execution order.
pub fn skeleton(pattern: ExecutionPattern) -> Vec<PhaseTemplate> {
    let design = vec![input("architecture", "architect", "architecture.design")];
    match pattern {
        ExecutionPattern::Standard => vec![
            requirements(),
            architecture(false, CheckpointRequirement::Informational),
            developers("generation", "Generation", &design),
            verification(developer_outputs("generation")),
        ],
        ExecutionPattern::Extended => {
            let mut docs_inputs = design.clone();
            docs_inputs.extend(developer_outputs("generation").into_iter().map(|mut r| {
                r.optional = true;
                r
            }));
            vec![
                requirements(),
                research(),
                architecture(true, CheckpointRequirement::Review),
                developers("generation", "Generation", &design),
                verification(developer_outputs("generation")),
                documentation(docs_inputs),
            ]
        }
        ExecutionPattern::Hierarchical => {
            let decomposition_id = PhaseId::new("decomposition");
            let decomposition = PhaseTemplate::fixed(
                PhaseSpec::new("decomposition", "Decomposition").with_task(
                    TaskSpec::new(&decomposition_id, "module-planner", "decomposition.modules")
                        .with_input(design[0].clone()),
                ),
            );
            let mut module_inputs = design.clone();
            module_inputs.push(input(
                "decomposition",
                "module-planner",
                "decomposition.modules",
            ));

            let integration_id = PhaseId::new("integration");
            let mut integrator =
                TaskSpec::new(&integration_id, "integrator", "integration.build");
            integrator.inputs = developer_outputs("modules");
            let integration = PhaseTemplate::fixed(
                PhaseSpec::new("integration", "Integration")
                    .with_task(integrator)
                    .sequential(),
            );

            let built = vec![input("integration", "integrator", "integration.build")];
            let mut docs_inputs = design.clone();
            docs_inputs.extend(built.iter().cloned().map(|mut r| {
                r.optional = true;
                r
            }));
            vec![
                requirements(),
                research(),
                architecture(true, CheckpointRequirement::Review),
                decomposition,
                developers("modules", "Modules", &module_inputs),
                integration,
                verification(built),
                documentation(docs_inputs),
            ]
        }
    }
}

/// Whether a task survives filtering for the given request tags.
pub fn task_applies(task: &TaskSpec, request_tags: &[String]) -> bool {
    task.tags.is_empty() || task.tags.iter().any(|t| request_tags.contains(t))
}

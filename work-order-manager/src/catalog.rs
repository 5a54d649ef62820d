//! Workflow catalog: pipeline definitions and workflow resolution
//!
//! Workflows are static stage lists loaded once at startup, either from the
//! builtin set or from a directory of YAML files. Resolution picks a workflow
//! for a new work order: an explicit override always wins, then the first
//! tag rule that matches, then the default.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use work_order_sdk::{
    ActivationPredicate, ContractResult, ResolutionReason, StageConfig, Station, WorkflowCatalog,
    WorkflowConfig, WorkflowResolution,
};

/// A tag-based routing rule. The first rule whose tag appears on the work
/// order decides the workflow.
#[derive(Debug, Clone)]
pub struct CatalogRule {
    pub id: String,
    pub tag: String,
    pub workflow_id: String,
}

/// In-memory catalog backing the [`WorkflowCatalog`] contract
pub struct StaticCatalog {
    workflows: HashMap<String, WorkflowConfig>,
    rules: Vec<CatalogRule>,
    default_workflow: String,
}

impl StaticCatalog {
    pub fn new(
        workflows: Vec<WorkflowConfig>,
        rules: Vec<CatalogRule>,
        default_workflow: impl Into<String>,
    ) -> Result<Self> {
        let default_workflow = default_workflow.into();
        let workflows: HashMap<String, WorkflowConfig> = workflows
            .into_iter()
            .map(|wf| (wf.id.clone(), wf))
            .collect();

        if !workflows.contains_key(&default_workflow) {
            return Err(anyhow!(
                "Default workflow '{}' is not in the catalog",
                default_workflow
            ));
        }
        for rule in &rules {
            if !workflows.contains_key(&rule.workflow_id) {
                return Err(anyhow!(
                    "Rule '{}' routes to unknown workflow '{}'",
                    rule.id,
                    rule.workflow_id
                ));
            }
        }
        for wf in workflows.values() {
            validate_workflow(wf)?;
        }

        Ok(Self {
            workflows,
            rules,
            default_workflow,
        })
    }

    /// The builtin pipeline set: feature (default), bug_fix, security_audit
    pub fn builtin() -> Self {
        let workflows = vec![feature_workflow(), bug_fix_workflow(), security_audit_workflow()];
        let rules = vec![
            CatalogRule {
                id: "route-bugs".to_string(),
                tag: "bug".to_string(),
                workflow_id: "bug_fix".to_string(),
            },
            CatalogRule {
                id: "route-security-audits".to_string(),
                tag: "security-audit".to_string(),
                workflow_id: "security_audit".to_string(),
            },
        ];
        // Builtin definitions are known-good
        Self::new(workflows, rules, "feature").expect("builtin catalog is valid")
    }

    /// Load every `*.yaml` / `*.yml` file in a directory as a workflow
    /// definition, layered over the builtin rules and default.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut workflows = vec![feature_workflow(), bug_fix_workflow(), security_audit_workflow()];
        let builtin = Self::builtin();

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read workflow directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let wf: WorkflowConfig = serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid workflow definition in {}", path.display()))?;

            // A file can replace a builtin of the same id
            workflows.retain(|existing| existing.id != wf.id);
            workflows.push(wf);
        }

        Self::new(workflows, builtin.rules, builtin.default_workflow)
    }

    pub fn get(&self, workflow_id: &str) -> Option<&WorkflowConfig> {
        self.workflows.get(workflow_id)
    }

    pub fn workflow_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }
}

impl WorkflowCatalog for StaticCatalog {
    fn resolve(
        &self,
        requested: Option<&str>,
        tags: &[String],
    ) -> ContractResult<WorkflowResolution> {
        if let Some(id) = requested {
            if !self.workflows.contains_key(id) {
                return Err(format!("Unknown workflow: {}", id).into());
            }
            return Ok(WorkflowResolution {
                workflow_id: id.to_string(),
                reason: ResolutionReason::ExplicitOverride,
                matched_rule_id: None,
            });
        }

        for rule in &self.rules {
            if tags.iter().any(|tag| *tag == rule.tag) {
                return Ok(WorkflowResolution {
                    workflow_id: rule.workflow_id.clone(),
                    reason: ResolutionReason::RuleMatch,
                    matched_rule_id: Some(rule.id.clone()),
                });
            }
        }

        Ok(WorkflowResolution {
            workflow_id: self.default_workflow.clone(),
            reason: ResolutionReason::Default,
            matched_rule_id: None,
        })
    }

    fn load(&self, workflow_id: &str) -> ContractResult<WorkflowConfig> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| format!("Unknown workflow: {}", workflow_id).into())
    }
}

/// Reject definitions the engine cannot run: empty stage lists, duplicate
/// stage refs, and review gates pointing at unknown or later stages.
fn validate_workflow(wf: &WorkflowConfig) -> Result<()> {
    if wf.stages.is_empty() {
        return Err(anyhow!("Workflow '{}' has no stages", wf.id));
    }

    let mut seen: Vec<&str> = Vec::new();
    for stage in &wf.stages {
        if seen.contains(&stage.stage_ref.as_str()) {
            return Err(anyhow!(
                "Workflow '{}' has duplicate stage ref '{}'",
                wf.id,
                stage.stage_ref
            ));
        }
        seen.push(&stage.stage_ref);
    }

    for (index, stage) in wf.stages.iter().enumerate() {
        if let Some(target) = &stage.review_gate_for {
            let target_index = wf
                .stages
                .iter()
                .position(|s| &s.stage_ref == target)
                .ok_or_else(|| {
                    anyhow!(
                        "Workflow '{}': gate '{}' reviews unknown stage '{}'",
                        wf.id,
                        stage.stage_ref,
                        target
                    )
                })?;
            if target_index >= index {
                return Err(anyhow!(
                    "Workflow '{}': gate '{}' must come after the stage it reviews",
                    wf.id,
                    stage.stage_ref
                ));
            }
        }
    }

    Ok(())
}

fn stage(stage_ref: &str, capability: Station) -> StageConfig {
    StageConfig {
        stage_ref: stage_ref.to_string(),
        capability,
        review_gate_for: None,
        is_loop: false,
        activation: None,
    }
}

fn gate(stage_ref: &str, capability: Station, reviews: &str) -> StageConfig {
    StageConfig {
        review_gate_for: Some(reviews.to_string()),
        ..stage(stage_ref, capability)
    }
}

fn activated(config: StageConfig, keys: &[&str]) -> StageConfig {
    StageConfig {
        activation: Some(ActivationPredicate {
            any_of: keys.iter().map(|k| k.to_string()).collect(),
        }),
        ..config
    }
}

/// Full pipeline for new feature work: plan, review the plan, build through
/// decomposed stories, review the build, then conditional testing and
/// security passes.
fn feature_workflow() -> WorkflowConfig {
    WorkflowConfig {
        id: "feature".to_string(),
        name: "Feature delivery".to_string(),
        stages: vec![
            stage("plan", Station::Planning),
            gate("plan_review", Station::Review, "plan"),
            StageConfig {
                is_loop: true,
                ..stage("build", Station::Build)
            },
            gate("build_review", Station::Review, "build"),
            activated(stage("testing", Station::Testing), &["hasCodeChanges"]),
            activated(
                stage("security", Station::Security),
                &["touchesSecurity", "isDeployable"],
            ),
        ],
    }
}

/// Shorter pipeline for bug fixes. Planning only happens when the report
/// still has unknowns.
fn bug_fix_workflow() -> WorkflowConfig {
    WorkflowConfig {
        id: "bug_fix".to_string(),
        name: "Bug fix".to_string(),
        stages: vec![
            activated(stage("plan", Station::Planning), &["hasUnknowns"]),
            activated(gate("plan_review", Station::Review, "plan"), &["hasUnknowns"]),
            StageConfig {
                is_loop: true,
                ..stage("build", Station::Build)
            },
            gate("build_review", Station::Review, "build"),
            activated(
                stage("security", Station::Security),
                &["touchesSecurity", "isDeployable"],
            ),
        ],
    }
}

/// Audit pipeline. Most stages are conditional: a pure code audit with no
/// unknowns and no findings collapses to the security pass plus its review.
fn security_audit_workflow() -> WorkflowConfig {
    WorkflowConfig {
        id: "security_audit".to_string(),
        name: "Security audit".to_string(),
        stages: vec![
            activated(stage("plan", Station::Planning), &["hasUnknowns"]),
            activated(
                stage("security", Station::Security),
                &["hasCodeChanges", "touchesSecurity"],
            ),
            gate("build_review", Station::Review, "security"),
            activated(stage("remediation", Station::Build), &["hasFindings"]),
            activated(
                gate("remediation_review", Station::Review, "remediation"),
                &["hasFindings"],
            ),
        ],
    }
}

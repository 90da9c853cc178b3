//! Workflow graph: steps, routing, gates, and skills.
//!
//! - `registry` -- step handlers and the name -> handler registry
//! - `routing` -- ordered per-step routing rules and `NextStep`
//! - `interrupt` -- gated steps and approval/denial resolution
//!
//! [`GraphBuilder`] assembles these and validates the result into an
//! immutable [`Graph`] shared by the engine.

pub mod interrupt;
pub mod registry;
pub mod routing;

use std::collections::HashMap;

use switchyard_types::session::SkillId;

use interrupt::InterruptController;
use registry::{StepHandler, StepRegistry};
use routing::{Condition, NextStep, RoutingTable};

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// A named sub-workflow entered by delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDefinition {
    pub id: SkillId,
    /// First step run when the skill is pushed or receives new input.
    pub entry: String,
    /// Scope description announced to the conversation on entry.
    pub description: String,
    /// Step to continue at when a child skill returns control here.
    pub resume: Option<String>,
}

impl SkillDefinition {
    pub fn new(id: impl Into<SkillId>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
            description: String::new(),
            resume: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn resume_at(mut self, step: impl Into<String>) -> Self {
        self.resume = Some(step.into());
        self
    }
}

/// Graph construction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("step name must not be empty")]
    EmptyName,

    #[error("step '{0}' registered twice")]
    DuplicateStep(String),

    #[error("skill '{0}' declared twice")]
    DuplicateSkill(String),

    #[error("{context} refers to unregistered step '{step}'")]
    UnknownStep { context: String, step: String },

    #[error("{context} refers to undeclared skill '{skill}'")]
    UnknownSkill { context: String, skill: String },
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Immutable, validated workflow graph.
#[derive(Debug)]
pub struct Graph {
    registry: StepRegistry,
    routing: RoutingTable,
    interrupts: InterruptController,
    root_entry: String,
    root_resume: Option<String>,
    skills: HashMap<SkillId, SkillDefinition>,
}

impl Graph {
    pub fn builder(root_entry: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(root_entry)
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn skill(&self, id: &SkillId) -> Option<&SkillDefinition> {
        self.skills.get(id)
    }

    pub fn skills(&self) -> impl Iterator<Item = &SkillDefinition> {
        self.skills.values()
    }

    pub fn root_entry(&self) -> &str {
        &self.root_entry
    }

    /// Entry step for the given active context (None = root).
    ///
    /// A skill id that is no longer declared falls back to the root entry.
    pub fn entry_for(&self, active: Option<&SkillId>) -> &str {
        match active.and_then(|id| self.skills.get(id)) {
            Some(skill) => &skill.entry,
            None => &self.root_entry,
        }
    }

    /// Resume step for the given context after a child skill pops.
    pub fn resume_for(&self, active: Option<&SkillId>) -> Option<&str> {
        match active {
            Some(id) => self.skills.get(id).and_then(|s| s.resume.as_deref()),
            None => self.root_resume.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Graph`]. Errors are collected and reported by
/// [`GraphBuilder::build`].
pub struct GraphBuilder {
    registry: StepRegistry,
    routing: RoutingTable,
    interrupts: InterruptController,
    root_entry: String,
    root_resume: Option<String>,
    skills: HashMap<SkillId, SkillDefinition>,
    errors: Vec<GraphError>,
}

impl GraphBuilder {
    pub fn new(root_entry: impl Into<String>) -> Self {
        Self {
            registry: StepRegistry::new(),
            routing: RoutingTable::new(),
            interrupts: InterruptController::default(),
            root_entry: root_entry.into(),
            root_resume: None,
            skills: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn step<H: StepHandler + 'static>(mut self, name: impl Into<String>, handler: H) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            self.errors.push(GraphError::EmptyName);
        } else if !self.registry.register(name.clone(), handler) {
            self.errors.push(GraphError::DuplicateStep(name));
        }
        self
    }

    /// Unconditional edge.
    pub fn edge(mut self, from: impl Into<String>, to: NextStep) -> Self {
        self.routing.edge(from, to);
        self
    }

    /// Conditional rule; evaluated in the order rules are added.
    pub fn when(mut self, from: impl Into<String>, when: Condition, to: NextStep) -> Self {
        self.routing.rule(from, when, to);
        self
    }

    /// Route an action request of `kind` made by `from`.
    pub fn on_action(self, from: impl Into<String>, kind: impl Into<String>, to: NextStep) -> Self {
        self.when(from, Condition::ActionRequested(kind.into()), to)
    }

    /// Require approval before `step` runs.
    pub fn gate(mut self, step: impl Into<String>) -> Self {
        self.interrupts.gate(step);
        self
    }

    pub fn skill(mut self, skill: SkillDefinition) -> Self {
        if self.skills.contains_key(&skill.id) {
            self.errors.push(GraphError::DuplicateSkill(skill.id.to_string()));
        } else {
            self.skills.insert(skill.id.clone(), skill);
        }
        self
    }

    /// Step the root context continues at when a skill returns control.
    pub fn resume_root_at(mut self, step: impl Into<String>) -> Self {
        self.root_resume = Some(step.into());
        self
    }

    /// Validate and freeze the graph. Reports the first problem found.
    pub fn build(self) -> Result<Graph, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let known = |context: &str, step: &str| -> Result<(), GraphError> {
            if self.registry.contains(step) {
                Ok(())
            } else {
                Err(GraphError::UnknownStep {
                    context: context.to_string(),
                    step: step.to_string(),
                })
            }
        };

        known("root entry", &self.root_entry)?;
        if let Some(resume) = &self.root_resume {
            known("root resume", resume)?;
        }

        let mut skill_ids: Vec<&SkillId> = self.skills.keys().collect();
        skill_ids.sort();
        for id in skill_ids {
            let skill = &self.skills[id];
            known(&format!("skill '{id}' entry"), &skill.entry)?;
            if let Some(resume) = &skill.resume {
                known(&format!("skill '{id}' resume"), resume)?;
            }
        }

        let mut targets: Vec<(&str, &NextStep)> = self.routing.targets().collect();
        targets.sort_by(|a, b| a.0.cmp(b.0));
        for (from, to) in targets {
            known(&format!("route source '{from}'"), from)?;
            match to {
                NextStep::Step(step) => known(&format!("route from '{from}'"), step)?,
                NextStep::Delegate(skill) if !self.skills.contains_key(skill) => {
                    return Err(GraphError::UnknownSkill {
                        context: format!("route from '{from}'"),
                        skill: skill.to_string(),
                    });
                }
                _ => {}
            }
        }

        for step in self.interrupts.gated_steps() {
            known("gate", step)?;
        }

        Ok(Graph {
            registry: self.registry,
            routing: self.routing,
            interrupts: self.interrupts,
            root_entry: self.root_entry,
            root_resume: self.root_resume,
            skills: self.skills,
        })
    }
}

// portage/src/pipeline/definition.rs

//! `StepRegistry`: the named, constrained set of steps a pipeline is built
//! from, and the placement resolution that turns it into a linear order.

use crate::core::context::ContextType;
use crate::core::step::RegisterStep;
use crate::error::{PortageError, PortageResult};
use crate::pipeline::execution::Pipeline;
use std::collections::{BTreeSet, HashMap};
use tracing::{event, instrument, Level};

/// Steps are kept in registration order, which breaks ties whenever the
/// placement constraints leave more than one valid order.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
  steps: Vec<RegisterStep>,
}

impl StepRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, step: RegisterStep) -> PortageResult<()> {
    if self.contains(&step.name) {
      return Err(PortageError::DuplicateStep { step_name: step.name });
    }
    event!(Level::TRACE, step_name = %step.name, "Registered step.");
    self.steps.push(step);
    Ok(())
  }

  /// Swaps the implementation of `step_name` for `replacement`'s, keeping the
  /// original name, position and ordering constraints. The replacement must
  /// operate on the same context types.
  pub fn replace(&mut self, step_name: &str, replacement: RegisterStep) -> PortageResult<()> {
    let existing = self
      .steps
      .iter_mut()
      .find(|step| step.name == step_name)
      .ok_or_else(|| PortageError::StepNotFound {
        step_name: step_name.to_string(),
      })?;

    if existing.input != replacement.input || existing.output != replacement.output {
      return Err(PortageError::StepContextMismatch {
        step_name: step_name.to_string(),
        expected: format!("{} -> {}", existing.input.name(), existing.output.name()),
        found: format!("{} -> {}", replacement.input.name(), replacement.output.name()),
      });
    }

    existing.step = replacement.step;
    if !replacement.description.is_empty() {
      existing.description = replacement.description;
    }
    Ok(())
  }

  pub fn remove(&mut self, step_name: &str) -> PortageResult<RegisterStep> {
    let position = self
      .steps
      .iter()
      .position(|step| step.name == step_name)
      .ok_or_else(|| PortageError::StepNotFound {
        step_name: step_name.to_string(),
      })?;
    Ok(self.steps.remove(position))
  }

  pub fn contains(&self, step_name: &str) -> bool {
    self.steps.iter().any(|step| step.name == step_name)
  }

  /// Names in registration order (not execution order; see [`Self::resolve`]).
  pub fn step_names(&self) -> Vec<&str> {
    self.steps.iter().map(|step| step.name.as_str()).collect()
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Resolves every placement constraint into one total order.
  ///
  /// Besides the explicit before/after constraints, connectors impose stage
  /// order: a step consuming a connector's output runs after it, and a plain
  /// behavior sharing a connector's input runs before it.
  #[instrument(name = "StepRegistry::resolve", skip_all, fields(num_steps = self.steps.len()), err(Display))]
  pub fn resolve(&self) -> PortageResult<Vec<&RegisterStep>> {
    let index_of: HashMap<&str, usize> = self
      .steps
      .iter()
      .enumerate()
      .map(|(idx, step)| (step.name.as_str(), idx))
      .collect();

    let count = self.steps.len();
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];

    for (idx, step) in self.steps.iter().enumerate() {
      for dep in &step.befores {
        match index_of.get(dep.step_name.as_str()) {
          Some(&target) => {
            successors[idx].insert(target);
          }
          None if dep.required => {
            return Err(PortageError::MissingStepDependency {
              step_name: step.name.clone(),
              dependency: dep.step_name.clone(),
            })
          }
          None => {}
        }
      }
      for dep in &step.afters {
        match index_of.get(dep.step_name.as_str()) {
          Some(&source) => {
            successors[source].insert(idx);
          }
          None if dep.required => {
            return Err(PortageError::MissingStepDependency {
              step_name: step.name.clone(),
              dependency: dep.step_name.clone(),
            })
          }
          None => {}
        }
      }
    }

    for (connector_idx, connector) in self.steps.iter().enumerate().filter(|(_, s)| s.is_connector()) {
      for (idx, step) in self.steps.iter().enumerate() {
        if idx == connector_idx {
          continue;
        }
        if step.input == connector.output {
          successors[connector_idx].insert(idx);
        } else if !step.is_connector() && step.input == connector.input {
          successors[idx].insert(connector_idx);
        }
      }
    }

    let mut in_degree = vec![0usize; count];
    for targets in &successors {
      for &target in targets {
        in_degree[target] += 1;
      }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&idx| in_degree[idx] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(idx) = ready.pop_first() {
      order.push(idx);
      for &target in &successors[idx] {
        in_degree[target] -= 1;
        if in_degree[target] == 0 {
          ready.insert(target);
        }
      }
    }

    if order.len() < count {
      let steps = (0..count)
        .filter(|idx| in_degree[*idx] > 0)
        .map(|idx| self.steps[idx].name.clone())
        .collect();
      return Err(PortageError::CyclicStepOrdering { steps });
    }

    Ok(order.into_iter().map(|idx| &self.steps[idx]).collect())
  }

  /// Resolves the order and checks that context types chain from `TRoot`
  /// through every connector.
  pub fn build<TRoot: Send + Sync + 'static>(&self) -> PortageResult<Pipeline<TRoot>> {
    let ordered = self.resolve()?;

    let mut current = ContextType::of::<TRoot>();
    for step in &ordered {
      if step.input != current {
        return Err(PortageError::StepContextMismatch {
          step_name: step.name.clone(),
          expected: current.name().to_string(),
          found: step.input.name().to_string(),
        });
      }
      current = step.output;
    }

    let names: Vec<&str> = ordered.iter().map(|step| step.name.as_str()).collect();
    event!(Level::DEBUG, steps = ?names, root = %std::any::type_name::<TRoot>(), "Pipeline built.");

    Ok(Pipeline::from_steps(
      ordered
        .into_iter()
        .map(|step| (step.name.clone(), step.step.clone()))
        .collect(),
    ))
  }
}

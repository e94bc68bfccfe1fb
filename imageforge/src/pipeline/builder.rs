//! Pipeline builder with validation.

use crate::errors::PipelineValidationError;
use crate::step::Step;
use std::collections::HashSet;

/// An ordered, validated list of steps.
///
/// The order is fixed at construction; steps run strictly one after the
/// other.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the pipeline has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Box<dyn Step>>) {
        (self.name, self.steps)
    }
}

/// Builder for creating validated pipelines.
#[derive(Debug)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Steps in insertion order.
    steps: Vec<Box<dyn Step>>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a step only when `condition` holds.
    #[must_use]
    pub fn step_if<F>(self, condition: bool, step: F) -> Self
    where
        F: FnOnce() -> Box<dyn Step>,
    {
        if condition {
            self.step(step())
        } else {
            self
        }
    }

    /// Returns the step names added so far.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no steps or two steps share a
    /// name.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.steps.is_empty() {
            return Err(
                PipelineValidationError::new("PIPELINE-EMPTY", "Pipeline has no steps")
                    .with_fix_hint("Add at least one step to the pipeline before building."),
            );
        }

        let mut seen = HashSet::new();
        let duplicates: Vec<String> = self
            .steps
            .iter()
            .map(|s| s.name())
            .filter(|name| !seen.insert(*name))
            .map(String::from)
            .collect();

        if !duplicates.is_empty() {
            return Err(PipelineValidationError::new(
                "PIPELINE-DUPLICATE_STEP",
                format!(
                    "Pipeline '{}' has duplicate step names: {}",
                    self.name,
                    duplicates.join(", ")
                ),
            )
            .with_steps(duplicates)
            .with_fix_hint("Give every step a unique name."));
        }

        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
        })
    }
}

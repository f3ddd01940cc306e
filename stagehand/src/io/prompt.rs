//! Stage prompt rendering.
//!
//! A repository may override the prompt of any stage by placing
//! `.stagehand/<workflow>/prompts/<stage>.md`; otherwise the embedded
//! template is used. Both are minijinja templates over [`PromptInputs`].

use std::fs;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::workflow::{Stage, Workflow};
use crate::io::paths::StagehandPaths;

const STAGE_TEMPLATE: &str = include_str!("prompts/stage.md");

/// Values substituted into a stage prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub stage: &'a Stage,
    pub session_id: &'a str,
    pub has_issues: bool,
    pub reentry_stage: &'a Stage,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        Self { env }
    }

    pub fn render_stage(
        &self,
        paths: &StagehandPaths,
        workflow: &dyn Workflow,
        inputs: &PromptInputs<'_>,
    ) -> Result<String> {
        let override_path = paths.prompt_override(inputs.stage);
        let source = if override_path.exists() {
            debug!(path = %override_path.display(), "using prompt override");
            fs::read_to_string(&override_path)
                .with_context(|| format!("read {}", override_path.display()))?
        } else {
            STAGE_TEMPLATE.to_string()
        };
        let next_stages: Vec<String> = workflow
            .valid_finish_targets()
            .iter()
            .map(ToString::to_string)
            .collect();
        let rendered = self
            .env
            .render_str(
                &source,
                context! {
                    task => inputs.task,
                    stage => inputs.stage.as_str(),
                    stage_label => workflow.label(inputs.stage),
                    workflow => workflow.kind().as_str(),
                    repo_root => paths.root.display().to_string(),
                    session => inputs.session_id,
                    has_issues => inputs.has_issues,
                    reentry_stage => inputs.reentry_stage.as_str(),
                    next_stages => next_stages,
                },
            )
            .with_context(|| format!("render prompt for stage {}", inputs.stage))?;
        Ok(rendered)
    }
}

//! Planner prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::decision::PLANNER_DECISION_SCHEMA;
use crate::io::planner::PlannerRequest;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");

/// Tool entry as shown to the planner.
#[derive(Debug, Serialize)]
struct ToolView<'a> {
    name: &'a str,
    description: &'a str,
    input_schema_json: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        Self { env }
    }

    fn render_planner(&self, request: &PlannerRequest<'_>) -> Result<String> {
        let tools: Vec<ToolView<'_>> = request
            .tools
            .iter()
            .map(|spec| ToolView {
                name: &spec.name,
                description: &spec.description,
                input_schema_json: spec.input_schema.to_string(),
            })
            .collect();
        let world_json = serde_json::to_string_pretty(&request.packet.world_snapshot)
            .context("serialize world snapshot")?;
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            decision_schema => PLANNER_DECISION_SCHEMA.trim(),
            thread_id => request.thread_id.to_string(),
            cycle => request.cycle,
            message => request.message,
            packet => request.packet,
            world_json => world_json,
            tools => tools,
        })?;
        Ok(rendered)
    }
}

/// Render the planner prompt for one cycle.
pub fn render_planner_prompt(request: &PlannerRequest<'_>) -> Result<String> {
    let rendered = PromptEngine::new().render_planner(request)?;
    debug!(bytes = rendered.len(), "planner prompt rendered");
    Ok(rendered)
}

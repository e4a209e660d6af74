//! Layered system prompt for spawned agents.
//!
//! Layers, in order: a fixed preamble stating the runtime contract and the
//! agent's identity/commands, the agent-type role, task context, and any
//! caller-supplied custom instructions. Layers the caller does not supply
//! are omitted entirely.

use crate::entity::records::{AgentType, Task};

/// Inputs to the prompt builder.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub agent_id: &'a str,
    pub agent_type: Option<AgentType>,
    pub task: Option<&'a Task>,
    pub custom_instructions: Option<&'a str>,
}

fn role_section(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Implementer => {
            "## Role\n\
             You are an implementer. Write working, tested code for the task \
             you were assigned. Prefer small, verifiable changes."
        }
        AgentType::Reviewer => {
            "## Role\n\
             You are a reviewer. Examine the changes for correctness, missing \
             tests, and regressions. Report findings; do not rewrite the work."
        }
        AgentType::Planner => {
            "## Role\n\
             You are a planner. Break the goal into concrete, ordered tasks \
             with clear completion criteria."
        }
    }
}

/// Build the layered system prompt for one agent.
pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are agent {} running inside the Sibyl orchestration runtime.\n\
         \n\
         Runtime contract:\n\
         - Your work is persisted and reviewed; report progress as you go.\n\
         - Privileged tool use may require human approval; when an action is \
         blocked awaiting approval, continue with other work or wait.\n\
         - Signal completion by finishing your final message; do not loop \
         idly.\n\
         - You may be paused, resumed, or stopped by the orchestrator at any \
         point; your session can be resumed from where it left off.",
        ctx.agent_id
    ));

    if let Some(agent_type) = ctx.agent_type {
        sections.push(role_section(agent_type).to_owned());
    }

    if let Some(task) = ctx.task {
        let mut section = format!("## Task\n**{}**", task.name);
        if !task.description.is_empty() {
            section.push_str("\n\n");
            section.push_str(&task.description);
        }
        if !task.technologies.is_empty() {
            section.push_str(&format!(
                "\n\nTechnologies: {}",
                task.technologies.join(", ")
            ));
        }
        sections.push(section);
    }

    if let Some(custom) = ctx.custom_instructions {
        if !custom.is_empty() {
            sections.push(format!("## Additional instructions\n{custom}"));
        }
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_names_the_agent() {
        let prompt = build_system_prompt(&PromptContext {
            agent_id: "agent_abc",
            ..Default::default()
        });
        assert!(prompt.contains("agent_abc"));
        assert!(prompt.contains("Runtime contract"));
    }

    #[test]
    fn layers_stack_in_order() {
        let mut task = Task::new("t1", "Fix the race", "org", "proj");
        task.description = "The watcher loses events.".to_owned();
        task.technologies = vec!["rust".to_owned()];

        let prompt = build_system_prompt(&PromptContext {
            agent_id: "agent_1",
            agent_type: Some(AgentType::Implementer),
            task: Some(&task),
            custom_instructions: Some("Do not touch CI config."),
        });

        let role_pos = prompt.find("## Role").unwrap();
        let task_pos = prompt.find("## Task").unwrap();
        let custom_pos = prompt.find("## Additional instructions").unwrap();
        assert!(role_pos < task_pos && task_pos < custom_pos);
        assert!(prompt.contains("Fix the race"));
        assert!(prompt.contains("The watcher loses events."));
        assert!(prompt.contains("rust"));
    }

    #[test]
    fn missing_layers_are_omitted() {
        let prompt = build_system_prompt(&PromptContext {
            agent_id: "agent_1",
            ..Default::default()
        });
        assert!(!prompt.contains("## Role"));
        assert!(!prompt.contains("## Task"));
        assert!(!prompt.contains("## Additional instructions"));
    }
}

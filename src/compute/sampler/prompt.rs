//! Prompt construction for each operator.

use crate::schema::{Candidate, Operator, TaskContext};

use super::{Message, Role};

const SEPARATOR: &str = "--------------------";

/// Messages for one sampling request: a system message and a user message.
pub fn build_prompt(operator: Operator, parents: &[Candidate], task: &TaskContext) -> Vec<Message> {
    vec![
        Message::new(Role::System, system_text(task)),
        Message::new(Role::User, user_text(operator, parents, task)),
    ]
}

fn system_text(task: &TaskContext) -> String {
    format!(
        "You design {} {}s. Follow the requested reply format exactly.",
        task.language, task.artifact
    )
}

fn user_text(operator: Operator, parents: &[Candidate], task: &TaskContext) -> String {
    let artifact = &task.artifact;
    let language = &task.language;
    let mut lines = vec![task.description.trim_end().to_string(), String::new()];

    match operator {
        Operator::Init | Operator::Seed => {
            lines.push(format!(
                "Write a new {artifact} in {language}. Use the template below and keep its signatures."
            ));
        }
        Operator::CrossoverBroad | Operator::CrossoverGuided => {
            lines.push(format!(
                "Here are {} existing {artifact}s with their implementations:",
                parents.len()
            ));
            push_parents(&mut lines, parents, artifact);
            lines.push(if operator == Operator::CrossoverBroad {
                format!("Create a new {artifact} whose form is entirely different from all of them.")
            } else {
                format!("Create a new {artifact} with a different form that is still motivated by them.")
            });
            lines.push("Use the template below and keep its signatures.".into());
        }
        Operator::MutateForm | Operator::MutateParams => {
            lines.push(format!("Here is an existing {artifact} with its implementation:"));
            push_parents(&mut lines, parents, artifact);
            lines.push(if operator == Operator::MutateForm {
                format!(
                    "Create a new {artifact} with a different form that can be seen as a modified version of it."
                )
            } else {
                format!(
                    "Identify its main parameters and create a new {artifact} that keeps the structure but uses different parameter settings."
                )
            });
            lines.push("Use the template below and keep its signatures.".into());
        }
    }

    lines.push(SEPARATOR.into());
    lines.push(task.template_program.trim_end().to_string());
    lines.push(SEPARATOR.into());
    push_format(&mut lines, operator, task);

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn push_parents(lines: &mut Vec<String>, parents: &[Candidate], artifact: &str) {
    for (i, parent) in parents.iter().enumerate() {
        lines.push(format!("No. {} {artifact}:", i + 1));
        lines.push(
            parent
                .rationale
                .as_deref()
                .unwrap_or("(no description)")
                .to_string(),
        );
        lines.push(parent.source_text.trim_end().to_string());
        lines.push(SEPARATOR.into());
    }
}

fn push_format(lines: &mut Vec<String>, operator: Operator, task: &TaskContext) {
    let format = &task.reply_format;
    let mut step = 1;
    if operator == Operator::CrossoverGuided {
        lines.push(format!(
            "{step}. Identify the backbone idea shared by the given {}s.",
            task.artifact
        ));
        step += 1;
        lines.push(format!(
            "{step}. Based on that backbone, describe your new {} in one sentence enclosed in << >>.",
            task.artifact
        ));
    } else {
        lines.push(format!(
            "{step}. Describe your idea in one concise sentence enclosed in << >>."
        ));
    }
    step += 1;
    lines.push(format!(
        "{step}. Write the complete {} implementation enclosed exactly as follows:",
        task.language
    ));
    lines.push(format.start_marker());
    lines.push("<complete implementation>".into());
    lines.push(format.end_marker());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskContext {
        TaskContext::new("Minimize total route cost.", "class Ruin { void apply() {} }")
            .with_language("Java")
            .with_artifact("ruin operator")
    }

    fn parent(i: usize) -> Candidate {
        Candidate::new(format!("class Ruin{i} {{}}"), Operator::Init)
            .with_rationale(format!("idea {i}"))
    }

    #[test]
    fn test_init_prompt_has_template_and_format() {
        let messages = build_prompt(Operator::Init, &[], &task());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        let user = &messages[1].content;
        assert!(user.starts_with("Minimize total route cost."));
        assert!(user.contains("class Ruin { void apply() {} }"));
        assert!(user.contains("[[CODE_START"));
        assert!(user.contains("CODE_END]]"));
        assert!(user.contains("<< >>"));
    }

    #[test]
    fn test_prompt_layout() {
        let user = &build_prompt(Operator::Init, &[], &task())[1].content;
        assert!(user.starts_with("Minimize total route cost.\n\nWrite a new ruin operator in Java."));
        assert!(user.contains(&format!(
            "{SEPARATOR}\nclass Ruin {{ void apply() {{}} }}\n{SEPARATOR}\n1. Describe"
        )));
        assert!(user.ends_with("[[CODE_START\n<complete implementation>\nCODE_END]]\n"));
    }

    #[test]
    fn test_crossover_lists_parents() {
        let parents = vec![parent(1), parent(2)];
        let user = &build_prompt(Operator::CrossoverBroad, &parents, &task())[1].content;
        assert!(user.contains("Here are 2 existing ruin operators"));
        assert!(user.contains("No. 1 ruin operator:\nidea 1\nclass Ruin1 {}"));
        assert!(user.contains("No. 2 ruin operator:\nidea 2\nclass Ruin2 {}"));
        assert!(user.contains("entirely different"));
    }

    #[test]
    fn test_guided_asks_for_backbone_first() {
        let parents = vec![parent(1), parent(2)];
        let user = &build_prompt(Operator::CrossoverGuided, &parents, &task())[1].content;
        assert!(user.contains("1. Identify the backbone idea"));
        assert!(user.contains("3. Write the complete Java implementation"));
    }

    #[test]
    fn test_mutations_differ() {
        let form = &build_prompt(Operator::MutateForm, &[parent(1)], &task())[1].content;
        let params = &build_prompt(Operator::MutateParams, &[parent(1)], &task())[1].content;
        assert!(form.contains("modified version"));
        assert!(params.contains("different parameter settings"));
        assert!(params.contains("idea 1"));
    }
}

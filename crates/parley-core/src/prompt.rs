//! Renders the model request for a turn.

use minijinja::{Environment, context};

use crate::error::PromptError;
use crate::history::HistoryEntry;
use crate::llm::PromptMessage;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful software engineering assistant. \
Use the conversation context to keep your answers consistent with what was said before.";

/// Template for the user message. Receives `context` (role-tagged history
/// lines, oldest first) and `prompt` (the new user message).
pub const DEFAULT_USER_TEMPLATE: &str =
    "Context Analysis:\n{{ context }}\n\nEngineer's Adaptive Task: {{ prompt }}";

#[derive(Debug)]
pub struct PromptComposer {
    env: Environment<'static>,
    system_prompt: String,
    user_template: String,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PromptComposer {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            env: Environment::new(),
            system_prompt: system_prompt.into(),
            user_template: DEFAULT_USER_TEMPLATE.to_owned(),
        }
    }

    pub fn with_user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Build the `[system, user]` message pair for the model.
    pub fn compose(
        &self,
        history: &[HistoryEntry],
        message: &str,
    ) -> Result<Vec<PromptMessage>, PromptError> {
        let user = self.env.render_str(
            &self.user_template,
            context! {
                context => render_history(history),
                prompt => message,
            },
        )?;

        Ok(vec![
            PromptMessage::system(self.system_prompt.clone()),
            PromptMessage::user(user),
        ])
    }
}

fn render_history(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|entry| format!("{}: {}", entry.role, entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Role;
    use crate::llm::PromptRole;

    #[test]
    fn composes_system_and_user_messages() {
        let composer = PromptComposer::new("be brief");
        let history = vec![
            HistoryEntry::new(Role::User, "what is rust?"),
            HistoryEntry::new(Role::Agent, "a language"),
        ];

        let messages = composer.compose(&history, "is it fast?").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, PromptRole::System);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].role, PromptRole::User);
        assert_eq!(
            messages[1].content,
            "Context Analysis:\nuser: what is rust?\nagent: a language\n\n\
             Engineer's Adaptive Task: is it fast?"
        );
    }

    #[test]
    fn message_text_is_not_interpreted_as_template() {
        let composer = PromptComposer::default().with_user_template("{{ prompt }}");
        let messages = composer.compose(&[], "{{ 1 + 1 }} <b>").unwrap();
        assert_eq!(messages[1].content, "{{ 1 + 1 }} <b>");
    }

    #[test]
    fn invalid_template_is_an_error() {
        let composer = PromptComposer::default().with_user_template("{{ prompt ");
        assert!(composer.compose(&[], "hi").is_err());
    }
}

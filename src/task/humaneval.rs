use super::{TaskDefinition, TaskSpec};
use crate::error::Result;
use crate::sampler::{Conversation, Message};

pub const HUMANEVAL_INSTRUCTION: &str = "Read the following function signature and docstring, and fully implement the function described. Your response should only contain the code for this function.\n";

pub struct HumanEval {
    instruction: String,
    system_message: Option<String>,
}

impl HumanEval {
    pub fn new() -> Self {
        Self {
            instruction: HUMANEVAL_INSTRUCTION.to_string(),
            system_message: None,
        }
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }
}

impl Default for HumanEval {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDefinition for HumanEval {
    fn name(&self) -> &str {
        "humaneval"
    }

    fn build_conversation(&self, task: &TaskSpec) -> Result<Conversation> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.system_message {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(format!("{}{}", self.instruction, task.prompt)));
        Conversation::new(messages)
    }

    fn extract_completion(&self, raw: &str) -> String {
        extract_code(raw)
    }

    fn assemble_program(&self, task: &TaskSpec, completion: &str) -> String {
        let prompt = task.prompt.trim();
        // Some models echo the whole prompt back, others answer with only the body.
        let head = if !prompt.is_empty() && completion.contains(prompt) {
            completion.to_string()
        } else {
            format!("{}{}", task.prompt, completion)
        };
        format!("{}\n\n{}\n\ncheck({})\n", head, task.test, task.entry_point)
    }
}

/// Body of the first fenced code block, or the text unchanged when there is none.
pub fn extract_code(text: &str) -> String {
    let Some(open) = text.find("```") else {
        return text.to_string();
    };
    let after_fence = &text[open + 3..];
    let Some(tag_end) = after_fence.find('\n') else {
        return text.to_string();
    };
    let body = &after_fence[tag_end + 1..];
    match body.find("```") {
        Some(close) => body[..close].to_string(),
        None => body.to_string(),
    }
}

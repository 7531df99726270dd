//! JavaScript dialogs
//!
//! An open alert/confirm/prompt blocks the page's script thread, so every
//! in-page evaluation would stall behind it. Both drivers answer dialogs
//! as soon as they open, through the handlers kept here.

use std::sync::{Arc, RwLock};

/// Answer to a `confirm()`: accept or cancel
pub type ConfirmHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Answer to a `prompt()`: the text to enter, or None to cancel
pub type PromptHandler = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    Alert,
    Confirm,
    Prompt,
    BeforeUnload,
}

impl DialogKind {
    /// Unknown kinds are treated as alerts
    pub fn parse(kind: &str) -> Self {
        match kind {
            "confirm" => DialogKind::Confirm,
            "prompt" => DialogKind::Prompt,
            "beforeunload" => DialogKind::BeforeUnload,
            _ => DialogKind::Alert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogReply {
    pub accept: bool,
    pub prompt_text: Option<String>,
}

pub struct DialogHandler {
    confirm: RwLock<ConfirmHandler>,
    prompt: RwLock<PromptHandler>,
}

impl DialogHandler {
    /// Confirms answer `accept`; prompts are answered with an empty
    /// string when accepting, cancelled otherwise
    pub fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            confirm: RwLock::new(Arc::new(move |_: &str| accept)),
            prompt: RwLock::new(Arc::new(move |_: &str| accept.then(String::new))),
        })
    }

    pub fn set_confirm(&self, handler: ConfirmHandler) {
        let mut confirm = self.confirm.write().unwrap_or_else(|p| p.into_inner());
        *confirm = handler;
    }

    pub fn set_prompt(&self, handler: PromptHandler) {
        let mut prompt = self.prompt.write().unwrap_or_else(|p| p.into_inner());
        *prompt = handler;
    }

    pub fn reply(&self, kind: DialogKind, message: &str) -> DialogReply {
        match kind {
            DialogKind::Confirm => {
                let confirm = self.confirm.read().unwrap_or_else(|p| p.into_inner()).clone();
                DialogReply {
                    accept: confirm(message),
                    prompt_text: None,
                }
            }
            DialogKind::Prompt => {
                let prompt = self.prompt.read().unwrap_or_else(|p| p.into_inner()).clone();
                match prompt(message) {
                    Some(text) => DialogReply {
                        accept: true,
                        prompt_text: Some(text),
                    },
                    None => DialogReply {
                        accept: false,
                        prompt_text: Some(String::new()),
                    },
                }
            }
            // Leaving the page; refusing would stall the next navigation
            DialogKind::BeforeUnload => DialogReply {
                accept: true,
                prompt_text: None,
            },
            DialogKind::Alert => DialogReply {
                accept: false,
                prompt_text: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let handler = DialogHandler::new(true);
        assert!(handler.reply(DialogKind::Confirm, "Sure?").accept);
        assert_eq!(
            handler.reply(DialogKind::Prompt, "Name?"),
            DialogReply {
                accept: true,
                prompt_text: Some(String::new())
            }
        );
        assert!(!handler.reply(DialogKind::Alert, "Hi").accept);
        assert!(handler.reply(DialogKind::BeforeUnload, "").accept);

        let refusing = DialogHandler::new(false);
        assert!(!refusing.reply(DialogKind::Confirm, "Sure?").accept);
        assert!(!refusing.reply(DialogKind::Prompt, "Name?").accept);
    }

    #[test]
    fn test_custom_handlers() {
        let handler = DialogHandler::new(true);
        handler.set_confirm(Arc::new(|message: &str| !message.contains("delete")));
        handler.set_prompt(Arc::new(|message: &str| Some(format!("answer to {}", message))));

        assert!(!handler.reply(DialogKind::Confirm, "Really delete?").accept);
        assert!(handler.reply(DialogKind::Confirm, "Continue?").accept);
        assert_eq!(
            handler.reply(DialogKind::Prompt, "age").prompt_text.as_deref(),
            Some("answer to age")
        );
        assert_eq!(DialogKind::parse("beforeunload"), DialogKind::BeforeUnload);
        assert_eq!(DialogKind::parse("unexpected"), DialogKind::Alert);
    }
}

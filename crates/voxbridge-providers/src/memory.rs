//! In-process dialog history.

use std::collections::HashMap;
use std::sync::Mutex;

use voxbridge_core::config::MemoryConfig;

use crate::{ChatMessage, MemoryProvider, Role};

/// Bounded per-session history: a system prompt plus the most recent
/// exchanges.
pub struct InMemoryDialog {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
    max_history_turns: usize,
    system_prompt: Option<String>,
}

impl InMemoryDialog {
    pub fn new(cfg: &MemoryConfig, system_prompt: Option<String>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_history_turns: cfg.max_history_turns,
            system_prompt,
        }
    }
}

impl MemoryProvider for InMemoryDialog {
    fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        let sessions = self.sessions.lock().expect("memory lock");
        let mut out = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            out.push(ChatMessage {
                role: Role::System,
                content: prompt.clone(),
            });
        }
        if let Some(entries) = sessions.get(session_id) {
            out.extend(entries.iter().cloned());
        }
        out
    }

    fn append(&self, session_id: &str, role: Role, text: &str) {
        let mut sessions = self.sessions.lock().expect("memory lock");
        let entries = sessions.entry(session_id.to_string()).or_default();
        entries.push(ChatMessage {
            role,
            content: text.to_string(),
        });

        // one turn = user + assistant
        let max_entries = self.max_history_turns * 2;
        if max_entries > 0 && entries.len() > max_entries {
            let excess = entries.len() - max_entries;
            entries.drain(..excess);
        }
    }

    fn forget(&self, session_id: &str) {
        self.sessions.lock().expect("memory lock").remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_includes_system_prompt() {
        let memory = InMemoryDialog::new(&MemoryConfig::default(), Some("be brief".into()));
        memory.append("s1", Role::User, "hi");
        let history = memory.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1].content, "hi");
    }

    #[test]
    fn test_history_is_per_session() {
        let memory = InMemoryDialog::new(&MemoryConfig::default(), None);
        memory.append("s1", Role::User, "one");
        memory.append("s2", Role::User, "two");
        assert_eq!(memory.history("s1").len(), 1);
        assert_eq!(memory.history("s2").len(), 1);
        memory.forget("s1");
        assert!(memory.history("s1").is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let cfg = MemoryConfig {
            max_history_turns: 2,
        };
        let memory = InMemoryDialog::new(&cfg, None);
        for i in 0..10 {
            memory.append("s1", Role::User, &format!("q{i}"));
            memory.append("s1", Role::Assistant, &format!("a{i}"));
        }
        let history = memory.history("s1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q8");
        assert_eq!(history[3].content, "a9");
    }
}

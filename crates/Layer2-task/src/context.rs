//! Agent execution context
//!
//! Each task owns exactly one context. It holds:
//! - Reasoning notes left by agents
//! - Tool calls (pending until completed)
//! - Named outputs shared between agents
//!
//! The context travels with the task across retries and handoffs; only the
//! current lease holder may write it back (see `handoff`).

use crate::agent::AgentId;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tool invocation made by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub agent: AgentId,
    pub started_at: DateTime<Utc>,
    /// `None` while the call is still pending
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

impl ToolCallRecord {
    pub fn is_pending(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// A note in the reasoning trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub agent: AgentId,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Mutable state an agent carries while working on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub task_id: TaskId,
    pub reasoning: Vec<ReasoningEntry>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Agents that have held this context, in order
    pub owners: Vec<AgentId>,
}

impl AgentContext {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            reasoning: Vec::new(),
            tool_calls: Vec::new(),
            outputs: BTreeMap::new(),
            owners: Vec::new(),
        }
    }

    pub fn add_reasoning(&mut self, agent: &AgentId, text: impl Into<String>) {
        self.reasoning.push(ReasoningEntry {
            agent: agent.clone(),
            text: text.into(),
            at: Utc::now(),
        });
    }

    /// Start a tool call; returns its index for `complete_tool_call`
    pub fn begin_tool_call(
        &mut self,
        agent: &AgentId,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> usize {
        self.tool_calls.push(ToolCallRecord {
            name: name.into(),
            arguments,
            agent: agent.clone(),
            started_at: Utc::now(),
            completed_at: None,
            result: None,
        });
        self.tool_calls.len() - 1
    }

    /// Returns false if the index is unknown or already completed
    pub fn complete_tool_call(&mut self, index: usize, result: serde_json::Value) -> bool {
        match self.tool_calls.get_mut(index) {
            Some(call) if call.is_pending() => {
                call.completed_at = Some(Utc::now());
                call.result = Some(result);
                true
            }
            _ => false,
        }
    }

    pub fn pending_tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.tool_calls.iter().filter(|c| c.is_pending())
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.outputs.insert(key.into(), value);
    }

    pub fn output(&self, key: &str) -> Option<&serde_json::Value> {
        self.outputs.get(key)
    }

    /// Serialized size, checked before handoff
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub(crate) fn record_owner(&mut self, agent: &AgentId) {
        if self.owners.last() != Some(agent) {
            self.owners.push(agent.clone());
        }
    }
}

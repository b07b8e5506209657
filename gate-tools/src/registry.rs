use crate::error::ToolError;
use crate::traits::{Approval, Tool, ToolSpec};
use gate_llm::ToolDefinition;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool {0:?} is already registered")]
    DuplicateName(String),

    #[error("invalid tool name: {0}")]
    InvalidName(String),

    #[error("tool {name:?} has an invalid input schema: {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("autonomous tool {0:?} has no executor")]
    MissingExecutor(String),
}

/// How a registered tool is resolved, fixed at registration.
#[derive(Clone)]
pub enum ToolKind {
    /// Runs as soon as the model proposes it.
    Autonomous(Arc<dyn Tool>),
    /// Runs only after an approval decision; the executor may be absent.
    Confirmed(Option<Arc<dyn Tool>>),
}

pub struct RegisteredTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    validator: jsonschema::Validator,
    kind: ToolKind,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    pub fn approval(&self) -> Approval {
        match self.kind {
            ToolKind::Autonomous(_) => Approval::Autonomous,
            ToolKind::Confirmed(_) => Approval::Confirmed,
        }
    }

    pub fn executor(&self) -> Option<&Arc<dyn Tool>> {
        match &self.kind {
            ToolKind::Autonomous(tool) => Some(tool),
            ToolKind::Confirmed(tool) => tool.as_ref(),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.clone(),
        }
    }

    /// Checks `input` against the compiled schema, reporting the first violation.
    pub fn validate_input(&self, input: &serde_json::Value) -> crate::Result<()> {
        self.validator
            .validate(input)
            .map_err(|e| ToolError::Validation(format!("{}: {e}", self.name)))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub approval: Approval,
    pub has_executor: bool,
    pub input_schema: serde_json::Value,
}

/// Static table of tools, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under the class its own spec declares.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        self.register(spec, Some(tool))
    }

    /// Registers `spec`. Autonomous tools must bring an executor; confirmed
    /// tools may be declared without one.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        executor: Option<Arc<dyn Tool>>,
    ) -> Result<(), RegistryError> {
        gate_llm::validate_tool_name(&spec.name)
            .map_err(|e| RegistryError::InvalidName(e.to_string()))?;
        if self.tools.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        let validator = jsonschema::validator_for(&spec.parameters_schema).map_err(|e| {
            RegistryError::InvalidSchema {
                name: spec.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let kind = match (spec.approval, executor) {
            (Approval::Autonomous, Some(tool)) => ToolKind::Autonomous(tool),
            (Approval::Autonomous, None) => return Err(RegistryError::MissingExecutor(spec.name)),
            (Approval::Confirmed, tool) => ToolKind::Confirmed(tool),
        };

        tracing::debug!(
            tool_name = %spec.name,
            approval = ?spec.approval,
            "tool registered"
        );
        self.order.push(spec.name.clone());
        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                name: spec.name,
                description: spec.description,
                schema: spec.parameters_schema,
                validator,
                kind,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    /// Model-facing definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.iter().map(RegisteredTool::definition).collect()
    }

    pub fn summaries(&self) -> Vec<ToolSummary> {
        self.iter()
            .map(|t| ToolSummary {
                name: t.name.clone(),
                description: t.description.clone(),
                approval: t.approval(),
                has_executor: t.executor().is_some(),
                input_schema: t.schema.clone(),
            })
            .collect()
    }
}

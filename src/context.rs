//! Prompt context: the layered conversation segment under evaluation.
//!
//! A context is an ordered sequence of layers, each with a fixed role. The
//! SYSTEM layer (at most one) carries the operator's framing, APPLICATION an
//! intermediate integration layer, USER the request being adjudicated, and
//! PRIOR_ASSISTANT earlier assistant output (including, for post-response
//! evaluation, the response itself).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of a single prompt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRole {
    System,
    Application,
    User,
    PriorAssistant,
}

impl LayerRole {
    /// Uppercase tag used when rendering the context for an evaluator.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Application => "APPLICATION",
            Self::User => "USER",
            Self::PriorAssistant => "ASSISTANT",
        }
    }
}

impl std::fmt::Display for LayerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One segment of a prompt context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub role: LayerRole,
    pub content: String,
}

impl Layer {
    pub fn new(role: LayerRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LayerRole::System, content)
    }

    pub fn application(content: impl Into<String>) -> Self {
        Self::new(LayerRole::Application, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LayerRole::User, content)
    }

    pub fn prior_assistant(content: impl Into<String>) -> Self {
        Self::new(LayerRole::PriorAssistant, content)
    }
}

/// Ordered sequence of layers plus an optional conversation id.
///
/// Invariants: at most one SYSTEM layer; a USER layer is required before the
/// context can be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    layers: Vec<Layer>,
    conversation_id: Option<String>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            conversation_id: None,
        }
    }

    /// Build a context from pre-assembled layers, enforcing the invariants.
    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        let ctx = Self {
            layers,
            conversation_id: None,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    pub fn with_system(mut self, content: impl Into<String>) -> Self {
        self.layers.push(Layer::system(content));
        self
    }

    pub fn with_application(mut self, content: impl Into<String>) -> Self {
        self.layers.push(Layer::application(content));
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.layers.push(Layer::user(content));
        self
    }

    pub fn with_prior_assistant(mut self, content: impl Into<String>) -> Self {
        self.layers.push(Layer::prior_assistant(content));
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Find the first layer with the given role.
    pub fn layer(&self, role: LayerRole) -> Option<&Layer> {
        self.layers.iter().find(|l| l.role == role)
    }

    /// Append the model's response as an assistant layer, for post-response
    /// evaluation of the same context.
    pub fn with_response(&self, response: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.layers.push(Layer::prior_assistant(response));
        ctx
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<()> {
        let system_count = self
            .layers
            .iter()
            .filter(|l| l.role == LayerRole::System)
            .count();
        if system_count > 1 {
            return Err(Error::config(format!(
                "prompt context has {system_count} SYSTEM layers, at most 1 allowed"
            )));
        }
        if self.layer(LayerRole::User).is_none() {
            return Err(Error::config("prompt context requires a USER layer"));
        }
        Ok(())
    }

    /// Render all layers as tagged text for an evaluator prompt.
    pub fn render(&self) -> String {
        self.layers
            .iter()
            .map(|l| format!("[{}]: {}", l.role.tag(), l.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Render the context with one layer singled out for adjudication.
    pub fn render_with_target(&self, target: LayerRole) -> String {
        let mut out = self.render();
        out.push_str(&format!("\n\nLayer under evaluation: {}", target.tag()));
        out
    }
}

impl Default for PromptContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_and_render() {
        let ctx = PromptContext::new()
            .with_system("You are a helpful assistant.")
            .with_user("Explain rate limiting.");

        assert_eq!(ctx.layers().len(), 2);
        let rendered = ctx.render();
        assert!(rendered.starts_with("[SYSTEM]: You are a helpful assistant."));
        assert!(rendered.contains("[USER]: Explain rate limiting."));
    }

    #[test]
    fn test_requires_user_layer() {
        let ctx = PromptContext::new().with_system("sys");
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_system_layers() {
        let ctx = PromptContext::from_layers(vec![
            Layer::system("a"),
            Layer::system("b"),
            Layer::user("c"),
        ]);
        assert!(ctx.is_err());
    }

    #[test]
    fn test_with_response_appends_assistant_layer() {
        let ctx = PromptContext::new().with_user("hi");
        let post = ctx.with_response("hello there");

        assert_eq!(ctx.layers().len(), 1);
        assert_eq!(post.layers().len(), 2);
        assert_eq!(post.layers()[1].role, LayerRole::PriorAssistant);
        assert!(post.render().contains("[ASSISTANT]: hello there"));
    }

    #[test]
    fn test_render_with_target_marks_layer() {
        let ctx = PromptContext::new().with_user("hi");
        let rendered = ctx.render_with_target(LayerRole::User);
        assert!(rendered.ends_with("Layer under evaluation: USER"));
    }
}

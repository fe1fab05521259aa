use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::{catalog::CatalogOption, fields::Fields};

pub type PhaseId = String;

/// Turns a freshly normalised value into the stored one, or explains why it is rejected
pub type Validator = Arc<dyn Fn(Value, &Fields) -> std::result::Result<Value, String> + Send + Sync>;

/// Picks the successor of a branching phase
pub type BranchRule = Arc<dyn Fn(&Answer, &Fields) -> Target + Send + Sync>;

/// Custom field writer replacing the default `field = value` assignment
pub type Writer = Arc<dyn Fn(&Answer, &mut Fields) + Send + Sync>;

/// A validated answer to one phase
#[derive(Debug, Clone)]
pub struct Answer {
    pub value: Value,
    /// Option picked at a selection phase
    pub option: Option<CatalogOption>,
}

impl Answer {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            option: None,
        }
    }

    pub fn option_id(&self) -> Option<&str> {
        self.option.as_ref().map(|o| o.id.as_str())
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Where the options of a selection phase come from
#[derive(Debug, Clone)]
pub enum ChoiceSource {
    Static(Vec<CatalogOption>),
    Catalog {
        name: String,
        extra: Vec<CatalogOption>,
    },
    /// Catalog named `{base}/{value of key_field}`
    ScopedCatalog {
        base: String,
        key_field: String,
        extra: Vec<CatalogOption>,
    },
}

impl ChoiceSource {
    /// Static options whose id and label are the same text
    pub fn labels<S: AsRef<str>>(labels: &[S]) -> Self {
        Self::Static(
            labels
                .iter()
                .map(|l| CatalogOption::new(l.as_ref(), l.as_ref()))
                .collect(),
        )
    }

    pub fn catalog(name: impl Into<String>) -> Self {
        Self::Catalog {
            name: name.into(),
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, option: CatalogOption) -> Self {
        match &mut self {
            Self::Static(options) => options.push(option),
            Self::Catalog { extra, .. } | Self::ScopedCatalog { extra, .. } => extra.push(option),
        }
        self
    }

    pub fn extra(&self) -> &[CatalogOption] {
        match self {
            Self::Static(options) => options,
            Self::Catalog { extra, .. } | Self::ScopedCatalog { extra, .. } => extra,
        }
    }

    /// Resolves the catalog name against the fields collected so far
    pub fn catalog_name(&self, fields: &Fields) -> Option<String> {
        match self {
            Self::Static(_) => None,
            Self::Catalog { name, .. } => Some(name.clone()),
            Self::ScopedCatalog { base, key_field, .. } => {
                let key = fields.get_str(key_field).unwrap_or_default();
                Some(format!("{base}/{key}"))
            }
        }
    }
}

/// What kind of input a phase accepts
#[derive(Debug, Clone)]
pub enum InputKind {
    FreeText,
    SingleChoice(ChoiceSource),
    File { allowed_extensions: Vec<String> },
    /// Only the named command moves the phase forward
    Command(String),
}

impl InputKind {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::FreeText => "текстовое сообщение",
            Self::SingleChoice(_) => "выбор варианта из списка",
            Self::File { .. } => "файл",
            Self::Command(_) => "команду",
        }
    }
}

/// Successor of a phase
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Phase(PhaseId),
    /// Completes the current repeating-group item and re-enters the group
    CloseItem,
}

impl Target {
    pub fn phase(id: impl Into<String>) -> Self {
        Self::Phase(id.into())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase(id) => write!(f, "{id}"),
            Self::CloseItem => write!(f, "<close item>"),
        }
    }
}

#[derive(Clone)]
pub enum Transition {
    Next(Target),
    Branch {
        rule: BranchRule,
        successors: Vec<Target>,
    },
    /// Stays on the phase, accumulating values, until the terminator command
    Repeat {
        terminator: String,
        exit: Target,
        min: usize,
    },
    Terminal,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(t) => f.debug_tuple("Next").field(t).finish(),
            Self::Branch { successors, .. } => f
                .debug_struct("Branch")
                .field("successors", successors)
                .finish_non_exhaustive(),
            Self::Repeat {
                terminator,
                exit,
                min,
            } => f
                .debug_struct("Repeat")
                .field("terminator", terminator)
                .field("exit", exit)
                .field("min", min)
                .finish(),
            Self::Terminal => write!(f, "Terminal"),
        }
    }
}

impl Transition {
    /// Every successor this transition may produce
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Self::Next(t) => vec![t],
            Self::Branch { successors, .. } => successors.iter().collect(),
            Self::Repeat { exit, .. } => vec![exit],
            Self::Terminal => Vec::new(),
        }
    }
}

/// One node of a form schema
#[derive(Clone)]
pub struct PhaseDef {
    pub id: PhaseId,
    pub prompt: String,
    /// Prompt used when the phase is re-entered by a loop
    pub repeat_prompt: Option<String>,
    pub step: Option<u8>,
    pub input: InputKind,
    pub field: Option<String>,
    pub validator: Option<Validator>,
    pub writer: Option<Writer>,
    pub transition: Transition,
    /// Repeating group this phase belongs to; its fields are written to the current item
    pub group: Option<String>,
}

impl fmt::Debug for PhaseDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDef")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("field", &self.field)
            .field("transition", &self.transition)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl PhaseDef {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, input: InputKind) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            repeat_prompt: None,
            step: None,
            input,
            field: None,
            validator: None,
            writer: None,
            transition: Transition::Terminal,
            group: None,
        }
    }

    pub fn text(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(id, prompt, InputKind::FreeText)
    }

    pub fn choice(id: impl Into<String>, prompt: impl Into<String>, source: ChoiceSource) -> Self {
        Self::new(id, prompt, InputKind::SingleChoice(source))
    }

    pub fn file<S: AsRef<str>>(
        id: impl Into<String>,
        prompt: impl Into<String>,
        allowed_extensions: &[S],
    ) -> Self {
        let allowed_extensions = allowed_extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        Self::new(id, prompt, InputKind::File { allowed_extensions })
    }

    pub fn command(id: impl Into<String>, prompt: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, prompt, InputKind::Command(name.into()))
    }

    /// Terminal phase; its prompt is the completion message
    pub fn terminal(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, message, InputKind::FreeText)
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.field = Some(name.into());
        self
    }

    pub fn step(mut self, step: u8) -> Self {
        self.step = Some(step);
        self
    }

    pub fn repeat_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.repeat_prompt = Some(prompt.into());
        self
    }

    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(Value, &Fields) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn write_with<F>(mut self, writer: F) -> Self
    where
        F: Fn(&Answer, &mut Fields) + Send + Sync + 'static,
    {
        self.writer = Some(Arc::new(writer));
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn next(mut self, target: impl Into<String>) -> Self {
        self.transition = Transition::Next(Target::Phase(target.into()));
        self
    }

    pub fn close_item(mut self) -> Self {
        self.transition = Transition::Next(Target::CloseItem);
        self
    }

    pub fn branch<F>(mut self, successors: Vec<Target>, rule: F) -> Self
    where
        F: Fn(&Answer, &Fields) -> Target + Send + Sync + 'static,
    {
        self.transition = Transition::Branch {
            rule: Arc::new(rule),
            successors,
        };
        self
    }

    pub fn repeat_until(mut self, terminator: impl Into<String>, exit: Target, min: usize) -> Self {
        self.transition = Transition::Repeat {
            terminator: terminator.into(),
            exit,
            min,
        };
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.transition, Transition::Terminal)
    }

    pub fn repeat_terminator(&self) -> Option<&str> {
        match &self.transition {
            Transition::Repeat { terminator, .. } => Some(terminator),
            _ => None,
        }
    }

    /// Runs the validator, if any, over a normalised value
    pub fn check(&self, value: Value, fields: &Fields) -> std::result::Result<Value, String> {
        match &self.validator {
            Some(validator) => validator(value, fields),
            None => Ok(value),
        }
    }

    /// Stores an accepted answer. Repeat phases append, others overwrite.
    pub fn write(&self, answer: &Answer, target: &mut Fields) {
        if let Some(writer) = &self.writer {
            writer(answer, target);
            return;
        }
        let Some(field) = &self.field else {
            return;
        };
        if matches!(self.transition, Transition::Repeat { .. }) {
            target.push(field, answer.value.clone());
        } else {
            target.set(field.clone(), answer.value.clone());
        }
    }
}

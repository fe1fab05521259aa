use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::{
    error::{FormError, Result},
    fields::Fields,
    phase::{Answer, InputKind, PhaseDef, PhaseId, Target, Transition},
};

/// Repeating sub-collection: items are collected until the terminator command
#[derive(Debug, Clone)]
pub struct GroupDef {
    pub id: String,
    /// First phase of every item
    pub entry: PhaseId,
    pub terminator: String,
    /// Phase entered once the loop is closed
    pub exit: PhaseId,
    pub min_items: usize,
    /// Summary label for the collected items
    pub label: String,
}

impl GroupDef {
    pub fn new(
        id: impl Into<String>,
        entry: impl Into<String>,
        terminator: impl Into<String>,
        exit: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            entry: entry.into(),
            terminator: terminator.into(),
            exit: exit.into(),
            min_items: 1,
        }
    }

    pub fn min_items(mut self, min: usize) -> Self {
        self.min_items = min;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Static, validated description of one form
#[derive(Debug)]
pub struct FormSchema {
    pub id: String,
    pub version: u32,
    /// Kind under which finished records are committed
    pub record_kind: String,
    pub title: String,
    entry: PhaseId,
    phases: HashMap<PhaseId, PhaseDef>,
    groups: HashMap<String, GroupDef>,
    /// Ordered (field, label) pairs rendered in prompt summaries
    pub summary_labels: Vec<(String, String)>,
    pub total_steps: Option<u8>,
}

impl FormSchema {
    pub fn entry_phase(&self) -> &PhaseDef {
        // presence checked by the builder
        &self.phases[&self.entry]
    }

    pub fn phase(&self, id: &str) -> Result<&PhaseDef> {
        self.phases
            .get(id)
            .ok_or_else(|| FormError::schema(format!("{}: unknown phase '{id}'", self.id)))
    }

    pub fn group(&self, id: &str) -> Result<&GroupDef> {
        self.groups
            .get(id)
            .ok_or_else(|| FormError::schema(format!("{}: unknown group '{id}'", self.id)))
    }

    /// Group whose item loop starts at `phase_id`
    pub fn group_entered_at(&self, phase_id: &str) -> Option<&GroupDef> {
        self.groups.values().find(|g| g.entry == phase_id)
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhaseDef> {
        self.phases.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupDef> {
        self.groups.values()
    }

    /// Fields written by file phases of a group
    pub fn group_file_fields(&self, group_id: &str) -> Vec<String> {
        self.phases
            .values()
            .filter(|p| p.group.as_deref() == Some(group_id))
            .filter(|p| matches!(p.input, InputKind::File { .. }))
            .filter_map(|p| p.field.clone())
            .collect()
    }

    /// Successor of `phase_id` for a validated answer.
    ///
    /// Branch rules are evaluated exactly once; a result outside the declared
    /// successors is a schema bug and fails with [`FormError::SchemaIntegrity`].
    /// Repeat phases stay put until their terminator.
    pub fn successor(&self, phase_id: &str, answer: &Answer, fields: &Fields) -> Result<Target> {
        let phase = self.phase(phase_id)?;
        match &phase.transition {
            Transition::Next(target) => Ok(target.clone()),
            Transition::Branch { rule, successors } => {
                let target = rule(answer, fields);
                if successors.contains(&target) {
                    Ok(target)
                } else {
                    Err(FormError::schema(format!(
                        "{}: branch of '{phase_id}' produced undeclared successor '{target}'",
                        self.id
                    )))
                }
            }
            Transition::Repeat { .. } => Ok(Target::Phase(phase_id.to_string())),
            Transition::Terminal => Err(FormError::schema(format!(
                "{}: terminal phase '{phase_id}' has no successor",
                self.id
            ))),
        }
    }
}

/// Builder for form schemas; `build` checks the graph invariants
pub struct FormSchemaBuilder {
    id: String,
    record_kind: String,
    version: u32,
    title: Option<String>,
    entry: Option<PhaseId>,
    phases: Vec<PhaseDef>,
    groups: Vec<GroupDef>,
    summary_labels: Vec<(String, String)>,
    total_steps: Option<u8>,
}

impl FormSchemaBuilder {
    pub fn new(id: impl Into<String>, record_kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            record_kind: record_kind.into(),
            version: 1,
            title: None,
            entry: None,
            phases: Vec::new(),
            groups: Vec::new(),
            summary_labels: Vec::new(),
            total_steps: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// The first phase added is the entry phase unless `set_entry` says otherwise
    pub fn add_phase(mut self, phase: PhaseDef) -> Self {
        if self.entry.is_none() {
            self.entry = Some(phase.id.clone());
        }
        self.phases.push(phase);
        self
    }

    pub fn add_group(mut self, group: GroupDef) -> Self {
        self.groups.push(group);
        self
    }

    pub fn set_entry(mut self, phase_id: impl Into<String>) -> Self {
        self.entry = Some(phase_id.into());
        self
    }

    pub fn label(mut self, field: impl Into<String>, label: impl Into<String>) -> Self {
        self.summary_labels.push((field.into(), label.into()));
        self
    }

    pub fn total_steps(mut self, steps: u8) -> Self {
        self.total_steps = Some(steps);
        self
    }

    pub fn build(self) -> Result<FormSchema> {
        let id = self.id;
        let fail = |msg: String| Err(FormError::schema(format!("{id}: {msg}")));

        let mut phases = HashMap::new();
        for phase in self.phases {
            if phases.contains_key(&phase.id) {
                return fail(format!("duplicate phase '{}'", phase.id));
            }
            phases.insert(phase.id.clone(), phase);
        }

        let Some(entry) = self.entry else {
            return fail("schema has no phases".to_string());
        };
        if !phases.contains_key(&entry) {
            return fail(format!("entry phase '{entry}' is not defined"));
        }
        if !phases.values().any(PhaseDef::is_terminal) {
            return fail("schema has no terminal phase".to_string());
        }

        let mut groups = HashMap::new();
        for group in self.groups {
            let Some(first) = phases.get(&group.entry) else {
                return fail(format!("group '{}' entry '{}' is not defined", group.id, group.entry));
            };
            if first.group.as_deref() != Some(group.id.as_str()) {
                return fail(format!("group '{}' entry '{}' is not a member", group.id, group.entry));
            }
            match phases.get(&group.exit) {
                None => return fail(format!("group '{}' exit '{}' is not defined", group.id, group.exit)),
                Some(exit) if exit.group.is_some() => {
                    return fail(format!("group '{}' exit '{}' is inside a group", group.id, group.exit));
                }
                Some(_) => {}
            }
            if group.terminator.trim().is_empty() {
                return fail(format!("group '{}' has an empty terminator", group.id));
            }
            if groups.insert(group.id.clone(), group).is_some() {
                return fail("duplicate group".to_string());
            }
        }

        for phase in phases.values() {
            if let Some(group) = &phase.group {
                if !groups.contains_key(group) {
                    return fail(format!("phase '{}' names unknown group '{group}'", phase.id));
                }
                if phase.is_terminal() {
                    return fail(format!("terminal phase '{}' is inside a group", phase.id));
                }
            }
            if let Transition::Branch { successors, .. } = &phase.transition {
                if successors.is_empty() {
                    return fail(format!("branch of '{}' declares no successors", phase.id));
                }
            }
            if let Transition::Repeat { terminator, .. } = &phase.transition {
                if terminator.trim().is_empty() {
                    return fail(format!("repeat phase '{}' has an empty terminator", phase.id));
                }
            }
            for target in phase.transition.targets() {
                match target {
                    Target::Phase(next) => match phases.get(next) {
                        None => {
                            return fail(format!("'{}' leads to undefined phase '{next}'", phase.id));
                        }
                        // entering a group mid-item would skip its entry phase
                        Some(next_def)
                            if next_def.group.is_some()
                                && next_def.group != phase.group
                                && !groups.values().any(|g| g.entry == *next) =>
                        {
                            return fail(format!(
                                "'{}' jumps into the middle of group at '{next}'",
                                phase.id
                            ));
                        }
                        Some(_) => {}
                    },
                    Target::CloseItem if phase.group.is_none() => {
                        return fail(format!("'{}' closes an item outside any group", phase.id));
                    }
                    Target::CloseItem => {}
                }
            }
        }

        // every phase must be reachable from the entry
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([entry.clone()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let phase = &phases[&current];
            if let Some(group) = groups.values().find(|g| g.entry == current) {
                queue.push_back(group.exit.clone());
            }
            for target in phase.transition.targets() {
                match target {
                    Target::Phase(next) => queue.push_back(next.clone()),
                    Target::CloseItem => {
                        if let Some(group) = phase.group.as_ref().and_then(|g| groups.get(g)) {
                            queue.push_back(group.entry.clone());
                        }
                    }
                }
            }
        }
        if let Some(orphan) = phases.keys().find(|p| !seen.contains(*p)) {
            return fail(format!("phase '{orphan}' is unreachable from '{entry}'"));
        }

        Ok(FormSchema {
            title: self.title.unwrap_or_else(|| id.clone()),
            id,
            version: self.version,
            record_kind: self.record_kind,
            entry,
            phases,
            groups,
            summary_labels: self.summary_labels,
            total_steps: self.total_steps,
        })
    }
}

/// Schemas loaded once at startup, immutable afterwards
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<FormSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, schema: FormSchema) -> Self {
        self.schemas.insert(schema.id.clone(), Arc::new(schema));
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<FormSchema>> {
        self.schemas
            .get(id)
            .cloned()
            .ok_or_else(|| FormError::UnknownSchema(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }
}

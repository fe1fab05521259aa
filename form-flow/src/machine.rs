//! Pure session transitions. No I/O happens here; the engine resolves inputs
//! (catalog lookups, file intake) before calling in and persists afterwards.

use crate::{
    error::{FormError, Result},
    fields::Fields,
    phase::{Answer, PhaseDef, PhaseId, Target, Transition},
    schema::FormSchema,
    session::Session,
};

/// What the engine must do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Moved {
    /// Waiting at `phase`; `repeat` when a loop came back around to it
    Waiting { phase: PhaseId, repeat: bool },
    /// Reached a terminal phase; the session is ready to commit
    Terminal { phase: PhaseId },
}

/// Whether group items keep the previous item's files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileCarryOver {
    /// Copy file fields of the previous item into the next one
    CopyPrevious,
    #[default]
    StartEmpty,
}

/// Moves a fresh session onto the schema's entry phase
pub fn enter_entry(schema: &FormSchema, session: &mut Session) -> Result<Moved> {
    let entry = schema.entry_phase().id.clone();
    enter(schema, session, &entry)
}

/// Applies a validated answer to the current phase and advances
pub fn accept(
    schema: &FormSchema,
    session: &mut Session,
    answer: &Answer,
    carry_over: FileCarryOver,
) -> Result<Moved> {
    let phase = schema.phase(&session.phase)?.clone();
    if phase.is_terminal() {
        return Err(FormError::schema(format!(
            "terminal phase '{}' accepts no input",
            phase.id
        )));
    }
    write_answer(session, &phase, answer)?;
    let view = session.visible_fields();
    let target = schema.successor(&phase.id, answer, &view)?;
    goto(schema, session, &phase, target, carry_over)
}

/// Handles the terminator of a repeat phase
pub fn finish_repeat(
    schema: &FormSchema,
    session: &mut Session,
    carry_over: FileCarryOver,
) -> Result<Moved> {
    let phase = schema.phase(&session.phase)?.clone();
    let Transition::Repeat { exit, min, .. } = &phase.transition else {
        return Err(FormError::schema(format!("'{}' is not a repeat phase", phase.id)));
    };
    let collected = phase
        .field
        .as_deref()
        .and_then(|f| scope_of(session, &phase).ok()?.get_value(f))
        .and_then(|v| v.as_array().map(Vec::len))
        .unwrap_or(0);
    if collected < *min {
        return Err(FormError::validation(format!(
            "Нужно добавить ещё {} перед завершением.",
            min - collected
        )));
    }
    goto(schema, session, &phase, exit.clone(), carry_over)
}

/// Handles a group terminator; only accepted at the group's entry phase
pub fn close_group(schema: &FormSchema, session: &mut Session) -> Result<Moved> {
    let Some(group_id) = session.active_group.clone() else {
        return Err(FormError::schema("group terminator outside a group"));
    };
    let group = schema.group(&group_id)?.clone();
    if session.phase != group.entry {
        return Err(FormError::validation(
            "Сначала завершите ввод текущей записи, затем отправьте команду ещё раз.",
        ));
    }
    if session.pending_group.len() < group.min_items {
        return Err(FormError::validation(format!(
            "Нужно добавить хотя бы {} запис(ь/и) перед завершением.",
            group.min_items
        )));
    }

    // the unstarted item only carries copied-over files, nothing the user typed
    session.current_item = None;
    session.items.append(&mut session.pending_group);
    session.active_group = None;
    enter(schema, session, &group.exit)
}

fn write_answer(session: &mut Session, phase: &PhaseDef, answer: &Answer) -> Result<()> {
    let target = scope_of_mut(session, phase)?;
    phase.write(answer, target);
    Ok(())
}

fn scope_of<'a>(session: &'a Session, phase: &PhaseDef) -> Result<&'a Fields> {
    match &phase.group {
        None => Ok(&session.fields),
        Some(_) => session
            .current_item
            .as_ref()
            .ok_or_else(|| FormError::schema(format!("'{}' has no open group item", phase.id))),
    }
}

fn scope_of_mut<'a>(session: &'a mut Session, phase: &PhaseDef) -> Result<&'a mut Fields> {
    match &phase.group {
        None => Ok(&mut session.fields),
        Some(_) => session
            .current_item
            .as_mut()
            .ok_or_else(|| FormError::schema(format!("'{}' has no open group item", phase.id))),
    }
}

fn goto(
    schema: &FormSchema,
    session: &mut Session,
    from: &PhaseDef,
    target: Target,
    carry_over: FileCarryOver,
) -> Result<Moved> {
    match target {
        Target::CloseItem => {
            let Some(group_id) = &from.group else {
                return Err(FormError::schema(format!(
                    "'{}' closes an item outside a group",
                    from.id
                )));
            };
            let group = schema.group(group_id)?;
            let finished = session.current_item.take().unwrap_or_default();
            let next = next_item(schema, group_id, &finished, carry_over);
            session.pending_group.push(finished);
            session.current_item = Some(next);
            session.phase = group.entry.clone();
            Ok(Moved::Waiting {
                phase: group.entry.clone(),
                repeat: true,
            })
        }
        Target::Phase(id) if id == from.id => Ok(Moved::Waiting {
            phase: id,
            repeat: true,
        }),
        Target::Phase(id) => enter(schema, session, &id),
    }
}

fn enter(schema: &FormSchema, session: &mut Session, phase_id: &str) -> Result<Moved> {
    let phase = schema.phase(phase_id)?;
    if let Some(group) = schema.group_entered_at(phase_id) {
        if session.active_group.as_deref() != Some(group.id.as_str()) {
            session.active_group = Some(group.id.clone());
            session.pending_group.clear();
            session.current_item = Some(Fields::new());
        }
    }
    session.phase = phase.id.clone();
    if phase.is_terminal() {
        Ok(Moved::Terminal {
            phase: phase.id.clone(),
        })
    } else {
        Ok(Moved::Waiting {
            phase: phase.id.clone(),
            repeat: false,
        })
    }
}

fn next_item(schema: &FormSchema, group_id: &str, previous: &Fields, policy: FileCarryOver) -> Fields {
    let mut item = Fields::new();
    if policy == FileCarryOver::CopyPrevious {
        for field in schema.group_file_fields(group_id) {
            if let Some(value) = previous.get_value(&field) {
                item.set(field, value.clone());
            }
        }
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::OwnerId,
        phase::{ChoiceSource, PhaseDef},
        schema::{FormSchemaBuilder, GroupDef},
    };
    use serde_json::json;

    fn schema() -> FormSchema {
        FormSchemaBuilder::new("participation", "contest_participation")
            .add_phase(
                PhaseDef::choice(
                    "select_participant_type",
                    "Кто участвует?",
                    ChoiceSource::labels(&["Преподаватель", "Студент"]),
                )
                .field("participant_type")
                .branch(
                    vec![Target::phase("enter_student_name"), Target::phase("enter_result")],
                    |answer, _| match answer.as_str() {
                        Some("Студент") => Target::phase("enter_student_name"),
                        _ => Target::phase("enter_result"),
                    },
                ),
            )
            .add_phase(
                PhaseDef::text("enter_student_name", "ФИО студента:")
                    .field("student_name")
                    .in_group("students")
                    .next("enter_group"),
            )
            .add_phase(
                PhaseDef::text("enter_group", "Группа:")
                    .field("group")
                    .in_group("students")
                    .next("upload_student_files"),
            )
            .add_phase(
                PhaseDef::file("upload_student_files", "Фото:", &["jpg"])
                    .field("confirmation_files")
                    .in_group("students")
                    .repeat_until("done", Target::CloseItem, 0),
            )
            .add_group(GroupDef::new(
                "students",
                "enter_student_name",
                "done_students",
                "enter_result",
            ))
            .add_phase(PhaseDef::text("enter_result", "Результат:").field("result").next("finish"))
            .add_phase(PhaseDef::terminal("finish", "Сохранено"))
            .build()
            .unwrap()
    }

    fn started(schema: &FormSchema) -> Session {
        let mut session = Session::new(OwnerId(1), "participation", "");
        enter_entry(schema, &mut session).unwrap();
        session
    }

    fn add_student(schema: &FormSchema, session: &mut Session, name: &str, group: &str, files: &[&str], policy: FileCarryOver) {
        accept(schema, session, &Answer::value(name), policy).unwrap();
        accept(schema, session, &Answer::value(group), policy).unwrap();
        for file in files {
            accept(schema, session, &Answer::value(json!({"token": file})), policy).unwrap();
        }
        finish_repeat(schema, session, policy).unwrap();
    }

    #[test]
    fn test_teacher_path_skips_group() {
        let schema = schema();
        let mut session = started(&schema);
        let moved = accept(&schema, &mut session, &Answer::value("Преподаватель"), FileCarryOver::StartEmpty).unwrap();
        assert_eq!(moved, Moved::Waiting { phase: "enter_result".into(), repeat: false });
        assert!(!session.in_group());

        let moved = accept(&schema, &mut session, &Answer::value("Диплом"), FileCarryOver::StartEmpty).unwrap();
        assert_eq!(moved, Moved::Terminal { phase: "finish".into() });
    }

    #[test]
    fn test_group_collects_items_then_folds() {
        let schema = schema();
        let policy = FileCarryOver::StartEmpty;
        let mut session = started(&schema);
        accept(&schema, &mut session, &Answer::value("Студент"), policy).unwrap();
        assert_eq!(session.active_group.as_deref(), Some("students"));
        assert!(session.current_item.is_some());

        add_student(&schema, &mut session, "Иванов", "101", &["a.jpg"], policy);
        add_student(&schema, &mut session, "Петров", "102", &[], policy);
        assert_eq!(session.pending_group.len(), 2);
        assert_eq!(session.phase, "enter_student_name");

        let moved = close_group(&schema, &mut session).unwrap();
        assert_eq!(moved, Moved::Waiting { phase: "enter_result".into(), repeat: false });
        assert!(session.pending_group.is_empty());
        assert!(session.current_item.is_none());
        assert_eq!(session.items.len(), 2);
        assert_eq!(session.items[0].get_str("student_name"), Some("Иванов"));
        assert!(!session.items[1].contains("confirmation_files"));
    }

    #[test]
    fn test_terminator_with_zero_items_is_rejected() {
        let schema = schema();
        let mut session = started(&schema);
        accept(&schema, &mut session, &Answer::value("Студент"), FileCarryOver::StartEmpty).unwrap();
        let before = session.clone();
        let err = close_group(&schema, &mut session).unwrap_err();
        assert!(matches!(err, FormError::Validation(_)));
        assert_eq!(session, before);
    }

    #[test]
    fn test_terminator_mid_item_is_rejected() {
        let schema = schema();
        let mut session = started(&schema);
        let policy = FileCarryOver::StartEmpty;
        accept(&schema, &mut session, &Answer::value("Студент"), policy).unwrap();
        add_student(&schema, &mut session, "Иванов", "101", &[], policy);
        accept(&schema, &mut session, &Answer::value("Петров"), policy).unwrap();

        let err = close_group(&schema, &mut session).unwrap_err();
        assert!(matches!(err, FormError::Validation(_)));
        assert_eq!(session.phase, "enter_group");
        assert_eq!(session.pending_group.len(), 1);
    }

    #[test]
    fn test_files_carry_over_when_configured() {
        let schema = schema();
        let policy = FileCarryOver::CopyPrevious;
        let mut session = started(&schema);
        accept(&schema, &mut session, &Answer::value("Студент"), policy).unwrap();
        add_student(&schema, &mut session, "Иванов", "101", &["a.jpg"], policy);

        let carried: Vec<serde_json::Value> = session
            .current_item
            .as_ref()
            .and_then(|item| item.get("confirmation_files"))
            .unwrap();
        assert_eq!(carried.len(), 1);

        add_student(&schema, &mut session, "Петров", "102", &["b.jpg"], policy);
        close_group(&schema, &mut session).unwrap();
        let files: Vec<serde_json::Value> = session.items[1].get("confirmation_files").unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_files_start_empty_by_default() {
        let schema = schema();
        let policy = FileCarryOver::default();
        let mut session = started(&schema);
        accept(&schema, &mut session, &Answer::value("Студент"), policy).unwrap();
        add_student(&schema, &mut session, "Иванов", "101", &["a.jpg"], policy);
        assert_eq!(session.current_item, Some(Fields::new()));
    }
}

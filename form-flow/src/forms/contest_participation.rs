//! Contest participation: one record per participating student.
//!
//! contest → (date, unless the contest already has one) → level → teacher →
//! nomination → form → participant type → students loop → result → photos

use crate::{
    catalog::CatalogOption,
    error::Result,
    phase::{ChoiceSource, PhaseDef, Target},
    schema::{FormSchema, FormSchemaBuilder, GroupDef},
    validators::{self, format_date, parse_date},
};

use super::{catalogs, field_keys::*};

pub const SCHEMA_ID: &str = "contest_participation";

pub const LEVELS: [&str; 6] = [
    "Внутривузовский/внутритехникумовский",
    "Муниципальный",
    "Региональный",
    "Областной",
    "Всероссийский",
    "Международный",
];
pub const PARTICIPATION_FORMS: [&str; 2] = ["Очная", "Заочная"];
pub const TEACHER: &str = "Преподаватель";
pub const STUDENT: &str = "Студент";

pub const DONE_STUDENTS: &str = "done_students";
pub const DONE: &str = "done";
pub const PHOTO_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "pdf"];

/// Option id for typing a teacher name not in the catalog
pub const OTHER_TEACHER: &str = "other";

fn contest_start_date(contest: &CatalogOption) -> Option<String> {
    contest
        .attributes
        .get_str(START_DATE)
        .and_then(parse_date)
        .map(format_date)
}

pub fn schema() -> Result<FormSchema> {
    FormSchemaBuilder::new(SCHEMA_ID, SCHEMA_ID)
        .title("Участие в конкурсе")
        .total_steps(10)
        .label(CONTEST_NAME, "Конкурс")
        .label(DATE, "Дата")
        .label(LEVEL, "Уровень")
        .label(TEACHER_NAME, "ФИО преподавателя")
        .label(NOMINATION, "Номинация")
        .label(PARTICIPATION_FORM, "Форма участия")
        .label(PARTICIPANT_TYPE, "Участник")
        .label(STUDENT_NAME, "ФИО студента")
        .label(GROUP, "Группа")
        .label(RESULT, "Результат")
        .label(CONFIRMATION_FILES, "Фото")
        .add_phase(
            PhaseDef::choice(
                "select_contest",
                "Заполнение участия в конкурсе\n\nВыберите конкурс для участия:",
                ChoiceSource::catalog(catalogs::CONTESTS),
            )
            .step(1)
            .write_with(|answer, fields| {
                if let Some(contest) = &answer.option {
                    fields.set(CONTEST_ID, contest.id.clone());
                    fields.set(CONTEST_NAME, contest.label.clone());
                    if let Some(date) = contest_start_date(contest) {
                        fields.set(DATE, date);
                    }
                }
            })
            .branch(
                vec![Target::phase("enter_date"), Target::phase("select_level")],
                |answer, _| match answer.option.as_ref().and_then(contest_start_date) {
                    Some(_) => Target::phase("select_level"),
                    None => Target::phase("enter_date"),
                },
            ),
        )
        .add_phase(
            PhaseDef::text("enter_date", "Введите дату проведения конкурса (дд.мм.гггг):")
                .step(2)
                .field(DATE)
                .validate(validators::date)
                .next("select_level"),
        )
        .add_phase(
            PhaseDef::choice("select_level", "Выберите уровень конкурса:", ChoiceSource::labels(&LEVELS))
                .step(3)
                .field(LEVEL)
                .next("select_teacher"),
        )
        .add_phase(
            PhaseDef::choice(
                "select_teacher",
                "Выберите ФИО преподавателя:",
                ChoiceSource::catalog(catalogs::TEACHERS)
                    .with_extra(CatalogOption::new(OTHER_TEACHER, "Ввести другое имя")),
            )
            .step(4)
            .write_with(|answer, fields| {
                if answer.option_id() != Some(OTHER_TEACHER) {
                    fields.set(TEACHER_NAME, answer.value.clone());
                }
            })
            .branch(
                vec![Target::phase("enter_teacher_name"), Target::phase("enter_nomination")],
                |answer, _| match answer.option_id() {
                    Some(OTHER_TEACHER) => Target::phase("enter_teacher_name"),
                    _ => Target::phase("enter_nomination"),
                },
            ),
        )
        .add_phase(
            PhaseDef::text("enter_teacher_name", "Введите ФИО преподавателя:")
                .step(4)
                .field(TEACHER_NAME)
                .next("enter_nomination"),
        )
        .add_phase(
            PhaseDef::text("enter_nomination", "Введите номинацию:")
                .step(5)
                .field(NOMINATION)
                .next("select_form"),
        )
        .add_phase(
            PhaseDef::choice(
                "select_form",
                "Выберите форму участия:",
                ChoiceSource::labels(&PARTICIPATION_FORMS),
            )
            .step(6)
            .field(PARTICIPATION_FORM)
            .next("select_participant_type"),
        )
        .add_phase(
            PhaseDef::choice(
                "select_participant_type",
                "Кто участвует?",
                ChoiceSource::labels(&[TEACHER, STUDENT]),
            )
            .step(7)
            .write_with(|answer, fields| {
                fields.set(PARTICIPANT_TYPE, answer.value.clone());
                if answer.as_str() == Some(TEACHER) {
                    fields.set(STUDENT_NAME, "-");
                    fields.set(GROUP, "-");
                }
            })
            .branch(
                vec![Target::phase("enter_student_name"), Target::phase("enter_result")],
                |answer, _| match answer.as_str() {
                    Some(STUDENT) => Target::phase("enter_student_name"),
                    _ => Target::phase("enter_result"),
                },
            ),
        )
        .add_phase(
            PhaseDef::text(
                "enter_student_name",
                "Введите ФИО студента. Вы можете добавить несколько студентов.\nКогда закончите, отправьте команду /done_students",
            )
            .repeat_prompt("Введите ФИО следующего студента или отправьте /done_students для завершения:")
            .step(8)
            .in_group("students")
            .field(STUDENT_NAME)
            .next("enter_group"),
        )
        .add_phase(
            PhaseDef::text("enter_group", "Введите группу для студента {student_name}:")
                .step(8)
                .in_group("students")
                .field(GROUP)
                .close_item(),
        )
        .add_group(
            GroupDef::new("students", "enter_student_name", DONE_STUDENTS, "enter_result")
                .label("Студенты"),
        )
        .add_phase(
            PhaseDef::text("enter_result", "Введите результат участия (например: Диплом I степени):")
                .step(9)
                .write_with(|answer, fields| {
                    fields.set(RESULT, answer.value.clone());
                    fields.set(CONFIRMATION_FILES, serde_json::Value::Array(Vec::new()));
                })
                .next("upload_confirmation"),
        )
        .add_phase(
            PhaseDef::file(
                "upload_confirmation",
                "Загрузите фото подтверждения участия (диплом, сертификат и т.д.).\nВы можете загрузить несколько фото. Когда закончите, напишите /done.",
                &PHOTO_EXTENSIONS,
            )
            .repeat_prompt("Фото добавлено. Загрузите ещё или напишите /done.")
            .step(10)
            .field(CONFIRMATION_FILES)
            .repeat_until(DONE, Target::phase("finish"), 0),
        )
        .add_phase(PhaseDef::terminal(
            "finish",
            "Участие в конкурсе успешно сохранено! Спасибо за заполнение!\n\nЕсли хотите добавить ещё одно участие, выберите снова «Добавить участие» в меню.",
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{DialogStatus, EngineConfig, StartMode},
        error::FormError,
        event::Event,
        files::FileRef,
        forms::test_support::{OWNER, college},
        records::RecordStore,
    };

    async fn send(c: &crate::forms::test_support::College, event: Event) -> DialogStatus {
        c.engine.handle_event(event).await.unwrap().status
    }

    fn waiting(phase: &str) -> DialogStatus {
        DialogStatus::WaitingForInput {
            phase: phase.to_string(),
        }
    }

    #[tokio::test]
    async fn test_olympiad_with_start_date_yields_one_full_record() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();

        assert_eq!(send(&c, Event::selection(OWNER, "olympiad-x")).await, waiting("select_level"));
        let prompt = c.outbox.drain(OWNER).pop().unwrap();
        assert!(prompt.text.contains("• Дата: 01.03.2026"));
        assert!(prompt.text.contains("Шаг 3/10"));
        assert_eq!(prompt.choices.len(), LEVELS.len());

        send(&c, Event::selection(OWNER, "Региональный")).await;
        assert_eq!(send(&c, Event::selection(OWNER, OTHER_TEACHER)).await, waiting("enter_teacher_name"));
        send(&c, Event::from_text(OWNER, "Петрова Анна Сергеевна")).await;
        send(&c, Event::from_text(OWNER, "Программирование")).await;
        send(&c, Event::selection(OWNER, "Очная")).await;
        assert_eq!(send(&c, Event::selection(OWNER, STUDENT)).await, waiting("enter_student_name"));
        send(&c, Event::from_text(OWNER, "Иванов")).await;
        let prompt = c.outbox.drain(OWNER).pop().unwrap();
        assert!(prompt.text.ends_with("Введите группу для студента Иванов:"));
        send(&c, Event::from_text(OWNER, "101")).await;
        assert_eq!(send(&c, Event::command(OWNER, DONE_STUDENTS)).await, waiting("enter_result"));
        send(&c, Event::from_text(OWNER, "Диплом I степени")).await;
        assert_eq!(
            send(&c, Event::file(OWNER, "diploma.jpg", vec![0xff, 0xd8])).await,
            waiting("upload_confirmation")
        );
        assert_eq!(send(&c, Event::command(OWNER, DONE)).await, DialogStatus::Completed { written: 1 });

        let records = c.records.list(SCHEMA_ID).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0].fields;
        assert_eq!(record.get_str(CONTEST_ID), Some("olympiad-x"));
        assert_eq!(record.get_str(CONTEST_NAME), Some("OlympiadX"));
        assert_eq!(record.get_str(DATE), Some("01.03.2026"));
        assert_eq!(record.get_str(LEVEL), Some("Региональный"));
        assert_eq!(record.get_str(TEACHER_NAME), Some("Петрова Анна Сергеевна"));
        assert_eq!(record.get_str(NOMINATION), Some("Программирование"));
        assert_eq!(record.get_str(PARTICIPATION_FORM), Some("Очная"));
        assert_eq!(record.get_str(PARTICIPANT_TYPE), Some(STUDENT));
        assert_eq!(record.get_str(STUDENT_NAME), Some("Иванов"));
        assert_eq!(record.get_str(GROUP), Some("101"));
        assert_eq!(record.get_str(RESULT), Some("Диплом I степени"));
        let files: Vec<FileRef> = record.get(CONFIRMATION_FILES).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].display_name, "diploma.jpg");
        assert_eq!(records[0].owner_id, OWNER);
    }

    #[tokio::test]
    async fn test_teacher_participant_skips_students() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        send(&c, Event::selection(OWNER, "olympiad-x")).await;
        send(&c, Event::selection(OWNER, "Международный")).await;
        assert_eq!(send(&c, Event::selection(OWNER, "t-1")).await, waiting("enter_nomination"));
        send(&c, Event::from_text(OWNER, "Методика")).await;
        send(&c, Event::selection(OWNER, "Заочная")).await;
        assert_eq!(send(&c, Event::selection(OWNER, TEACHER)).await, waiting("enter_result"));
        send(&c, Event::from_text(OWNER, "Участник")).await;
        assert_eq!(send(&c, Event::from_text(OWNER, "/done")).await, DialogStatus::Completed { written: 1 });

        let records = c.records.list(SCHEMA_ID).await.unwrap();
        let record = &records[0].fields;
        assert_eq!(record.get_str(TEACHER_NAME), Some("Петрова Анна Сергеевна"));
        assert_eq!(record.get_str(STUDENT_NAME), Some("-"));
        assert_eq!(record.get_str(GROUP), Some("-"));
        let files: Vec<FileRef> = record.get(CONFIRMATION_FILES).unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_manual_date_is_validated_and_normalised() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        assert_eq!(send(&c, Event::selection(OWNER, "open-cup")).await, waiting("enter_date"));

        let err = c
            .engine
            .handle_event(Event::from_text(OWNER, "завтра"))
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::Validation(msg) if msg.contains("дд.мм.гггг")));

        assert_eq!(send(&c, Event::from_text(OWNER, "5.4.2026")).await, waiting("select_level"));
        let session = c.engine.session(OWNER).await.unwrap().unwrap();
        assert_eq!(session.fields.get_str(DATE), Some("05.04.2026"));
    }

    #[tokio::test]
    async fn test_each_student_gets_a_record() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        for event in [
            Event::selection(OWNER, "olympiad-x"),
            Event::selection(OWNER, "Областной"),
            Event::selection(OWNER, "t-1"),
            Event::from_text(OWNER, "Робототехника"),
            Event::selection(OWNER, "Очная"),
            Event::selection(OWNER, STUDENT),
        ] {
            send(&c, event).await;
        }

        let err = c
            .engine
            .handle_event(Event::command(OWNER, DONE_STUDENTS))
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::Validation(_)));

        let students = [("Иванов", "101"), ("Петров", "102"), ("Сидоров", "103")];
        for (i, (name, group)) in students.iter().enumerate() {
            send(&c, Event::from_text(OWNER, name)).await;
            if i == 2 {
                // terminator between name and group is rejected, the item is kept
                let err = c
                    .engine
                    .handle_event(Event::command(OWNER, DONE_STUDENTS))
                    .await
                    .unwrap_err();
                assert!(matches!(err, FormError::Validation(_)));
            }
            send(&c, Event::from_text(OWNER, group)).await;
        }
        let prompt = c.outbox.drain(OWNER).pop().unwrap();
        assert!(prompt.text.contains("• Студенты: Иванов, 101; Петров, 102; Сидоров, 103"));
        assert!(prompt.text.contains("/done_students для завершения"));

        send(&c, Event::command(OWNER, DONE_STUDENTS)).await;
        send(&c, Event::from_text(OWNER, "Диплом II степени")).await;
        send(&c, Event::file(OWNER, "group.png", vec![1])).await;
        let status = send(&c, Event::command(OWNER, DONE)).await;
        assert_eq!(status, DialogStatus::Completed { written: 3 });

        let records = c.records.list(SCHEMA_ID).await.unwrap();
        let pairs: Vec<_> = records
            .iter()
            .map(|r| {
                (
                    r.fields.get_str(STUDENT_NAME).unwrap().to_string(),
                    r.fields.get_str(GROUP).unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            students
                .iter()
                .map(|(n, g)| (n.to_string(), g.to_string()))
                .collect::<Vec<_>>()
        );
        for record in &records {
            assert_eq!(record.fields.get_str(RESULT), Some("Диплом II степени"));
            assert_eq!(record.fields.get_str(LEVEL), Some("Областной"));
        }
    }

    #[tokio::test]
    async fn test_photo_format_is_checked() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        for event in [
            Event::selection(OWNER, "olympiad-x"),
            Event::selection(OWNER, "Муниципальный"),
            Event::selection(OWNER, "t-1"),
            Event::from_text(OWNER, "Дизайн"),
            Event::selection(OWNER, "Очная"),
            Event::selection(OWNER, TEACHER),
            Event::from_text(OWNER, "Лауреат"),
        ] {
            send(&c, event).await;
        }
        let err = c
            .engine
            .handle_event(Event::file(OWNER, "notes.docx", vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::Validation(msg) if msg.contains("jpg, jpeg, png, pdf")));
        let session = c.engine.session(OWNER).await.unwrap().unwrap();
        assert_eq!(session.phase, "upload_confirmation");
    }
}

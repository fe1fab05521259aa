//! Contest creation by an administrator. Finished records become catalog contests.

use serde_json::Value;

use crate::{
    error::Result,
    phase::{ChoiceSource, PhaseDef, Target},
    schema::{FormSchema, FormSchemaBuilder},
    validators,
};

use super::{catalogs, field_keys::*};

pub const SCHEMA_ID: &str = "contest_admin";
pub const RECORD_KIND: &str = "contest";
pub const DONE: &str = "done";
pub const DOCUMENT_EXTENSIONS: [&str; 4] = ["pdf", "docx", "doc", "xlsx"];

pub fn schema() -> Result<FormSchema> {
    FormSchemaBuilder::new(SCHEMA_ID, RECORD_KIND)
        .title("Добавление конкурса")
        .label(NAME, "Название")
        .label(START_DATE, "Начало")
        .label(END_DATE, "Окончание")
        .label(DESCRIPTION, "Описание")
        .label(FILES, "Файлы")
        .add_phase(
            PhaseDef::text("enter_name", "Введите название конкурса:")
                .field(NAME)
                .next("enter_dates"),
        )
        .add_phase(
            PhaseDef::text(
                "enter_dates",
                "Введите даты проведения конкурса (в формате ДД.ММ.ГГГГ - ДД.ММ.ГГГГ или ДД.ММ.ГГГГ):",
            )
            .validate(validators::date_range)
            .write_with(|answer, fields| {
                for key in [START_DATE, END_DATE] {
                    let value = answer.value.get(key).cloned().unwrap_or(Value::Null);
                    fields.set(key, value);
                }
            })
            .next("enter_description"),
        )
        .add_phase(
            PhaseDef::text("enter_description", "Введите описание конкурса:")
                .write_with(|answer, fields| {
                    fields.set(DESCRIPTION, answer.value.clone());
                    fields.set(FILES, Value::Array(Vec::new()));
                })
                .next("upload_files"),
        )
        .add_phase(
            PhaseDef::file(
                "upload_files",
                "Прикрепите файл (pdf, docx, doc, xlsx). Чтобы закончить загрузку файлов, нажмите /done.",
                &DOCUMENT_EXTENSIONS,
            )
            .repeat_prompt("Файл загружен. Прикрепите еще файлы или нажмите /done.")
            .field(FILES)
            .repeat_until(DONE, Target::phase("select_responsible"), 0),
        )
        .add_phase(
            PhaseDef::choice(
                "select_responsible",
                "Выберите ответственного за конкурс:",
                ChoiceSource::catalog(catalogs::RESPONSIBLES),
            )
            .write_with(|answer, fields| {
                fields.set(RESPONSIBLE, answer.value.clone());
                if let Some(id) = answer.option_id() {
                    fields.set(RESPONSIBLE_ID, id);
                }
            })
            .next("finish"),
        )
        .add_phase(PhaseDef::terminal("finish", "Конкурс «{name}» успешно создан!"))
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

    #[tokio::test]
    async fn test_contest_is_created_with_range_and_files() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        c.engine
            .handle_event(Event::from_text(OWNER, "Весенний хакатон"))
            .await
            .unwrap();

        let err = c
            .engine
            .handle_event(Event::from_text(OWNER, "20.04.2026 - 10.04.2026"))
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::Validation(msg) if msg.contains("позже даты окончания")));

        c.engine
            .handle_event(Event::from_text(OWNER, "10.04.2026 - 20.04.2026"))
            .await
            .unwrap();
        c.engine
            .handle_event(Event::from_text(OWNER, "Командные соревнования"))
            .await
            .unwrap();

        let err = c
            .engine
            .handle_event(Event::file(OWNER, "poster.png", vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, FormError::Validation(_)));
        c.engine
            .handle_event(Event::file(OWNER, "Положение.PDF", vec![1]))
            .await
            .unwrap();
        c.engine
            .handle_event(Event::file(OWNER, "Заявка.docx", vec![2]))
            .await
            .unwrap();
        let next = c.engine.handle_event(Event::command(OWNER, DONE)).await.unwrap();
        assert_eq!(next.prompt.choices.len(), 1);

        let done = c.engine.handle_event(Event::selection(OWNER, "r-7")).await.unwrap();
        assert_eq!(done.status, DialogStatus::Completed { written: 1 });
        assert_eq!(done.prompt.text, "Конкурс «Весенний хакатон» успешно создан!");

        let records = c.records.list(RECORD_KIND).await.unwrap();
        let record = &records[0].fields;
        assert_eq!(record.get_str(START_DATE), Some("10.04.2026"));
        assert_eq!(record.get_str(END_DATE), Some("20.04.2026"));
        assert_eq!(record.get_str(RESPONSIBLE), Some("Сидорова Е.В."));
        assert_eq!(record.get_str(RESPONSIBLE_ID), Some("r-7"));
        let files: Vec<FileRef> = record.get(FILES).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["Положение.PDF", "Заявка.docx"]);
    }

    #[tokio::test]
    async fn test_single_date_is_the_end_date() {
        let c = college(EngineConfig::default());
        c.engine.start(OWNER, SCHEMA_ID, StartMode::Reject).await.unwrap();
        c.engine.handle_event(Event::from_text(OWNER, "Конкурс эссе")).await.unwrap();
        c.engine.handle_event(Event::from_text(OWNER, "30.05.2026")).await.unwrap();

        let session = c.engine.session(OWNER).await.unwrap().unwrap();
        assert_eq!(session.fields.get_value(START_DATE), Some(&Value::Null));
        assert_eq!(session.fields.get_str(END_DATE), Some("30.05.2026"));
        assert_eq!(session.phase, "enter_description");
    }
}

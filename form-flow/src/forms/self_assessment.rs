//! Self-assessment sheet entry. Olympiad activity types (2.1.x) also pick the contest.

use crate::{
    catalog::CatalogOption,
    error::Result,
    phase::{ChoiceSource, PhaseDef, Target},
    schema::{FormSchema, FormSchemaBuilder},
    validators,
};

use super::{catalogs, field_keys::*};

pub const SCHEMA_ID: &str = "self_assessment";

/// Activity type codes that refer to a contest
pub const CONTEST_TYPES: [&str; 3] = ["2.1.1", "2.1.2", "2.1.3"];

/// Option id for entering a contest missing from the catalog
pub const NEW_CONTEST: &str = "new_contest";

pub const FILE_EXTENSIONS: [&str; 6] = ["pdf", "jpg", "jpeg", "png", "doc", "docx"];

pub fn schema() -> Result<FormSchema> {
    FormSchemaBuilder::new(SCHEMA_ID, SCHEMA_ID)
        .title("Лист самообследования")
        .label(EVENT_TYPE, "Тип мероприятия")
        .label(CONTEST_NAME, "Конкурс")
        .label(EVENT_NAME, "Мероприятие")
        .label(DESCRIPTION, "Характеристика")
        .label(RESULT, "Результат")
        .label(SOCIAL_MEDIA_LINK, "Публикация")
        .add_phase(
            PhaseDef::choice(
                "select_event_type",
                "Выберите тип мероприятия:",
                ChoiceSource::catalog(catalogs::ACTIVITY_TYPES),
            )
            .write_with(|answer, fields| {
                fields.set(EVENT_TYPE, answer.value.clone());
                if let Some(code) = answer.option_id() {
                    fields.set(EVENT_TYPE_CODE, code);
                }
            })
            .branch(
                vec![Target::phase("select_contest"), Target::phase("enter_event_name")],
                |answer, _| match answer.option_id() {
                    Some(code) if CONTEST_TYPES.contains(&code) => Target::phase("select_contest"),
                    _ => Target::phase("enter_event_name"),
                },
            ),
        )
        .add_phase(
            PhaseDef::choice(
                "select_contest",
                "Выберите конкурс из списка или добавьте новый:",
                ChoiceSource::ScopedCatalog {
                    base: catalogs::CONTESTS.to_string(),
                    key_field: EVENT_TYPE_CODE.to_string(),
                    extra: vec![CatalogOption::new(NEW_CONTEST, "Добавить новый конкурс")],
                },
            )
            .write_with(|answer, fields| {
                if let Some(contest) = answer.option.as_ref().filter(|o| o.id != NEW_CONTEST) {
                    fields.set(CONTEST_ID, contest.id.clone());
                    fields.set(CONTEST_NAME, contest.label.clone());
                }
            })
            .branch(
                vec![Target::phase("enter_contest_name"), Target::phase("enter_event_name")],
                |answer, _| match answer.option_id() {
                    Some(NEW_CONTEST) => Target::phase("enter_contest_name"),
                    _ => Target::phase("enter_event_name"),
                },
            ),
        )
        .add_phase(
            PhaseDef::text("enter_contest_name", "Введите название нового конкурса:")
                .field(CONTEST_NAME)
                .next("enter_event_name"),
        )
        .add_phase(
            PhaseDef::text("enter_event_name", "Введите название мероприятия:")
                .field(EVENT_NAME)
                .next("enter_description"),
        )
        .add_phase(
            PhaseDef::text("enter_description", "Введите краткую характеристику мероприятия:")
                .field(DESCRIPTION)
                .next("enter_result"),
        )
        .add_phase(
            PhaseDef::text("enter_result", "Введите результат участия:")
                .field(RESULT)
                .next("enter_social_link"),
        )
        .add_phase(
            PhaseDef::text(
                "enter_social_link",
                "Введите ссылку на публикацию в соцсетях (если есть) или отправьте 'нет':",
            )
            .field(SOCIAL_MEDIA_LINK)
            .validate(validators::optional_text)
            .next("upload_confirmation"),
        )
        .add_phase(
            PhaseDef::file(
                "upload_confirmation",
                "Отправьте файл подтверждения (грамота, диплом, сертификат):",
                &FILE_EXTENSIONS,
            )
            .field(CONFIRMATION_FILE)
            .next("finish"),
        )
        .add_phase(PhaseDef::terminal("finish", "Данные успешно сохранены!"))
        .build()
}
